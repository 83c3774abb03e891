use crate::{
    error::PipelineError,
    series::{cross, dot},
    volume::{Geometry, Volume},
};

use dicom::{
    object::{DefaultDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions: {} is {found:?}, expected {expected:?}", path.display())]
    InconsistentDimensions {
        path: PathBuf,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Failed to decode pixel data of {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },

    #[error("DICOM error in {}: {source}", path.display())]
    Dicom {
        path: PathBuf,
        source: dicom::object::ReadError,
    },
}

impl From<VolumeLoaderError> for PipelineError {
    fn from(e: VolumeLoaderError) -> Self {
        PipelineError::VolumeBuild(e.to_string())
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from file paths that are already in series order.
    ///
    /// Every file must decode; a series with an unreadable slice is
    /// rejected rather than stacked with a gap.
    ///
    /// # Errors
    ///
    /// Returns error if a file cannot be read or decoded, or if slice
    /// dimensions disagree.
    pub fn load_from_file_paths(paths: &[impl AsRef<Path> + Sync]) -> Result<Volume, VolumeLoaderError> {
        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        let objects: Vec<(PathBuf, DefaultDicomObject)> = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref().to_path_buf();
                open_file(&path)
                    .map(|object| (path.clone(), object))
                    .map_err(|source| VolumeLoaderError::Dicom { path, source })
            })
            .collect::<Result<_, _>>()?;

        let images: Vec<Array2<f32>> = objects
            .par_iter()
            .map(|(path, object)| Self::decode_image(path, object))
            .collect::<Result<_, _>>()?;

        Self::validate_dimensions(&objects, &images)?;

        let volume_array = Self::build_volume_array(&images);
        let (geometry, slice_spacing) = Self::get_geometry(&objects);
        let (column_spacing, row_spacing) = Self::get_pixel_spacing(&objects).unwrap_or((1.0, 1.0));

        debug!(
            slices = images.len(),
            rows = volume_array.dim().1,
            columns = volume_array.dim().2,
            "Stacked DICOM slices"
        );

        Ok(Volume::new(
            volume_array,
            (column_spacing, row_spacing, slice_spacing),
            geometry,
        ))
    }

    /// Decode the first frame of a slice, with the modality LUT applied.
    fn decode_image(
        path: &Path,
        dicom_object: &DefaultDicomObject,
    ) -> Result<Array2<f32>, VolumeLoaderError> {
        let decode_error = |message: String| VolumeLoaderError::Decode {
            path: path.to_path_buf(),
            message,
        };
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|e| decode_error(e.to_string()))?;
        let options = ConvertOptions::new();
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
            .map_err(|e| decode_error(e.to_string()))
    }

    fn validate_dimensions(
        objects: &[(PathBuf, DefaultDicomObject)],
        images: &[Array2<f32>],
    ) -> Result<(), VolumeLoaderError> {
        let expected = images[0].dim();
        match images.iter().position(|img| img.dim() != expected) {
            Some(index) => Err(VolumeLoaderError::InconsistentDimensions {
                path: objects[index].0.clone(),
                expected,
                found: images[index].dim(),
            }),
            None => Ok(()),
        }
    }

    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }

    /// (column spacing, row spacing) from PixelSpacing, which stores the
    /// row spacing first.
    fn get_pixel_spacing(objects: &[(PathBuf, DefaultDicomObject)]) -> Option<(f32, f32)> {
        objects.iter().find_map(|(_, dicom_object)| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;
            match pixel_spacing.as_slice() {
                [row, column, ..] => Some((*column, *row)),
                _ => None,
            }
        })
    }

    fn get_geometry(objects: &[(PathBuf, DefaultDicomObject)]) -> (Geometry, f32) {
        let mut geometry = Geometry::default();
        let first = &objects[0].1;

        if let Some(o) = Self::get_vector::<6>(first, tags::IMAGE_ORIENTATION_PATIENT) {
            geometry.row_direction = [o[0], o[1], o[2]];
            geometry.column_direction = [o[3], o[4], o[5]];
            geometry.slice_direction = cross(geometry.row_direction, geometry.column_direction);
        }

        let first_position = Self::get_vector::<3>(first, tags::IMAGE_POSITION_PATIENT);
        if let Some(origin) = first_position {
            geometry.origin = origin;
        }

        let last_position = objects
            .last()
            .and_then(|(_, object)| Self::get_vector::<3>(object, tags::IMAGE_POSITION_PATIENT));

        if let (Some(first), Some(last)) = (first_position, last_position) {
            if objects.len() > 1 {
                let delta = [last[0] - first[0], last[1] - first[1], last[2] - first[2]];
                let distance = dot(delta, delta).sqrt();
                if distance > f64::EPSILON {
                    geometry.slice_direction = delta.map(|d| d / distance);
                    let spacing = distance / (objects.len() - 1) as f64;
                    return (geometry, spacing as f32);
                }
            }
        }

        (geometry, Self::get_slice_thickness(objects).unwrap_or(1.0))
    }

    fn get_slice_thickness(objects: &[(PathBuf, DefaultDicomObject)]) -> Option<f32> {
        objects.iter().find_map(|(_, dicom_object)| {
            [tags::SPACING_BETWEEN_SLICES, tags::SLICE_THICKNESS]
                .into_iter()
                .find_map(|tag| dicom_object.element(tag).ok()?.to_float32().ok())
                .filter(|value| *value > 0.0)
        })
    }

    fn get_vector<const N: usize>(
        dicom_object: &DefaultDicomObject,
        tag: dicom::core::Tag,
    ) -> Option<[f64; N]> {
        let values = dicom_object.element(tag).ok()?.to_multi_float64().ok()?;
        values.get(..N)?.try_into().ok()
    }
}

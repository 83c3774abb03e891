use crate::enums::SortBy;
use crate::error::{PipelineError, Result};

use dicom::object::{DefaultDicomObject, OpenFileOptions};
use dicom_dictionary_std::tags;
use indexmap::IndexMap;
use rayon::prelude::*;
use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// One DICOM series found in a directory scan, with its member files in
/// series order.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDescriptor {
    pub series_uid: String,
    pub files: Vec<PathBuf>,
}

impl SeriesDescriptor {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Header fields needed to group and order a slice, read without pixel data.
struct SliceHeader {
    path: PathBuf,
    series_uid: String,
    order: Option<f64>,
}

impl SliceHeader {
    fn read(path: &Path, sort_by: SortBy) -> Option<Self> {
        let object = match OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
        {
            Ok(object) => object,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping non-DICOM file");
                return None;
            }
        };

        let series_uid = object
            .element(tags::SERIES_INSTANCE_UID)
            .ok()?
            .to_str()
            .ok()?
            .trim_end_matches(['\0', ' '])
            .to_string();
        if series_uid.is_empty() {
            return None;
        }

        Some(Self {
            path: path.to_path_buf(),
            series_uid,
            order: Self::sort_key(&object, sort_by),
        })
    }

    fn sort_key(object: &DefaultDicomObject, sort_by: SortBy) -> Option<f64> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                Self::normal_position(object).or_else(|| Self::instance_number(object))
            }
            SortBy::TablePosition => object
                .element(tags::TABLE_POSITION)
                .ok()?
                .to_float64()
                .ok(),
            SortBy::InstanceNumber => Self::instance_number(object),
            SortBy::None => None,
        }
    }

    /// Distance of the slice origin along the slice normal.
    fn normal_position(object: &DefaultDicomObject) -> Option<f64> {
        let position = object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        if position.len() < 3 {
            return None;
        }

        let orientation = object
            .element(tags::IMAGE_ORIENTATION_PATIENT)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .filter(|o| o.len() >= 6);

        match orientation {
            Some(o) => {
                let normal = cross([o[0], o[1], o[2]], [o[3], o[4], o[5]]);
                Some(dot(normal, [position[0], position[1], position[2]]))
            }
            None => Some(position[2]),
        }
    }

    fn instance_number(object: &DefaultDicomObject) -> Option<f64> {
        object
            .element(tags::INSTANCE_NUMBER)
            .ok()?
            .to_int::<i32>()
            .ok()
            .map(f64::from)
    }
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// All series present directly inside one directory.
///
/// Series are kept in enumeration order: the order in which each series UID
/// is first seen while walking the directory's files sorted by path. Files
/// inside a series follow the [`SortBy`] rule, with path order for ties and
/// for slices missing the ordering attribute (those sort last).
#[derive(Debug)]
pub struct SeriesIndex {
    directory: PathBuf,
    series: IndexMap<String, Vec<PathBuf>>,
}

impl SeriesIndex {
    pub fn scan(directory: impl AsRef<Path>, sort_by: SortBy) -> Result<Self> {
        let directory = directory.as_ref();

        let entries = fs::read_dir(directory).map_err(|e| {
            PipelineError::VolumeBuild(format!("reading {}: {e}", directory.display()))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let headers: Vec<SliceHeader> = paths
            .par_iter()
            .filter_map(|path| SliceHeader::read(path, sort_by))
            .collect();

        let mut grouped: IndexMap<String, Vec<SliceHeader>> = IndexMap::new();
        for header in headers {
            grouped
                .entry(header.series_uid.clone())
                .or_default()
                .push(header);
        }

        let series = grouped
            .into_iter()
            .map(|(uid, mut slices)| {
                if !matches!(sort_by, SortBy::None) {
                    slices.sort_by(|a, b| compare_order(a.order, b.order));
                }
                (uid, slices.into_iter().map(|s| s.path).collect())
            })
            .collect();

        debug!(directory = %directory.display(), files = paths.len(), "Scanned DICOM directory");

        Ok(Self {
            directory: directory.to_path_buf(),
            series,
        })
    }

    /// Series identifiers in enumeration order.
    pub fn series_ids(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn files_for_series(&self, series_uid: &str) -> Option<&[PathBuf]> {
        self.series.get(series_uid).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn into_descriptors(self) -> Vec<SeriesDescriptor> {
        self.series
            .into_iter()
            .map(|(series_uid, files)| SeriesDescriptor { series_uid, files })
            .collect()
    }

    /// The series with the most files; the earliest enumerated one wins a tie.
    pub fn into_best(self) -> Result<SeriesDescriptor> {
        let directory = self.directory.clone();
        largest_series(self.into_descriptors())
            .ok_or(PipelineError::NoSeriesFound { directory })
    }
}

fn compare_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// `Iterator::max_by_key` keeps the last maximum; this keeps the first.
fn largest_series(
    candidates: impl IntoIterator<Item = SeriesDescriptor>,
) -> Option<SeriesDescriptor> {
    candidates.into_iter().fold(None, |best, candidate| match best {
        Some(best) if best.len() >= candidate.len() => Some(best),
        _ => Some(candidate),
    })
}

/// Scan `directory` and return the series with the greatest file count.
///
/// # Errors
///
/// [`PipelineError::NoSeriesFound`] when the directory holds no readable
/// DICOM series.
pub fn select_best_series(directory: impl AsRef<Path>, sort_by: SortBy) -> Result<SeriesDescriptor> {
    SeriesIndex::scan(directory, sort_by)?.into_best()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(uid: &str, files: usize) -> SeriesDescriptor {
        SeriesDescriptor {
            series_uid: uid.to_string(),
            files: (0..files).map(|i| PathBuf::from(format!("{uid}-{i}.dcm"))).collect(),
        }
    }

    #[test]
    fn largest_series_wins() {
        let best = largest_series(vec![descriptor("a", 3), descriptor("b", 12), descriptor("c", 5)]);
        assert_eq!(best.unwrap().series_uid, "b");
    }

    #[test]
    fn tie_resolves_to_first_enumerated() {
        let candidates = vec![descriptor("scout", 2), descriptor("first", 40), descriptor("second", 40)];
        for _ in 0..3 {
            let best = largest_series(candidates.clone()).unwrap();
            assert_eq!(best.series_uid, "first");
        }
    }

    #[test]
    fn no_candidates_yields_none() {
        assert!(largest_series(Vec::new()).is_none());
    }

    #[test]
    fn missing_order_sorts_last() {
        let mut keys = vec![None, Some(2.0), Some(-1.5), None, Some(0.0)];
        keys.sort_by(|a, b| compare_order(*a, *b));
        assert_eq!(keys, vec![Some(-1.5), Some(0.0), Some(2.0), None, None]);
    }

    #[test]
    fn axial_normal_points_along_z() {
        let normal = cross([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        assert_eq!(normal, [0.0, 0.0, 1.0]);
        assert_eq!(dot(normal, [10.0, -4.0, 7.5]), 7.5);
    }

    #[test]
    fn empty_directory_has_no_series() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not dicom").unwrap();

        let err = select_best_series(dir.path(), SortBy::default()).unwrap_err();
        assert!(matches!(err, PipelineError::NoSeriesFound { .. }));
    }
}

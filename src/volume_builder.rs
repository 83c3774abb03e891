use crate::{
    enums::SortBy,
    error::{PipelineError, Result},
    nifti,
    series::{SeriesDescriptor, select_best_series},
    volume_loader::VolumeLoader,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const DEFAULT_VOLUME_FILE_NAME: &str = "ct.nii.gz";

/// Stacks one series into a volume and persists it under a fixed file name.
#[derive(Debug, Clone)]
pub struct VolumeBuilder {
    file_name: String,
}

impl Default for VolumeBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_FILE_NAME)
    }
}

impl VolumeBuilder {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn volume_path(&self, output_directory: &Path) -> PathBuf {
        output_directory.join(&self.file_name)
    }

    /// Decode `descriptor` and write it to `<output_directory>/<file name>`,
    /// replacing any earlier volume. Returns the absolute path written.
    pub fn build_volume(
        &self,
        descriptor: &SeriesDescriptor,
        output_directory: &Path,
        log: &mut dyn FnMut(String),
    ) -> Result<PathBuf> {
        create_output_directory(output_directory)?;

        let volume = VolumeLoader::load_from_file_paths(&descriptor.files)?;
        let target = self.volume_path(output_directory);
        let target = std::path::absolute(&target).map_err(|e| {
            PipelineError::VolumeBuild(format!("resolving {}: {e}", target.display()))
        })?;
        nifti::write_volume(&volume, &target)
            .map_err(|e| PipelineError::VolumeBuild(format!("writing {}: {e}", target.display())))?;

        info!(
            series = %descriptor.series_uid,
            slices = volume.slice_count(),
            path = %target.display(),
            "Volume written"
        );
        log(format!("NIfTI created: {}", target.display()));
        Ok(target)
    }
}

fn create_output_directory(directory: &Path) -> Result<()> {
    fs::create_dir_all(directory).map_err(|e| {
        PipelineError::VolumeBuild(format!("creating {}: {e}", directory.display()))
    })
}

/// The whole conversion stage: select the largest series of a DICOM folder
/// and build it into a volume file.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub source_directory: PathBuf,
    pub output_directory: PathBuf,
    pub sort_by: SortBy,
    pub builder: VolumeBuilder,
}

impl ConversionJob {
    pub fn run(&self, log: &mut dyn FnMut(String)) -> Result<PathBuf> {
        create_output_directory(&self.output_directory)?;

        log("Reading DICOM folder...".to_string());
        let descriptor = select_best_series(&self.source_directory, self.sort_by)?;
        log(format!(
            "Selected series {} ({} files)",
            descriptor.series_uid,
            descriptor.len()
        ));

        self.builder
            .build_volume(&descriptor, &self.output_directory, log)
    }
}

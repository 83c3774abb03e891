use crate::{
    catalog::{TaskCatalog, is_mr_task},
    config::{PipelineConfig, ToolCommand},
    enums::{Device, Method},
    error::{PipelineError, Result},
    runner::{CommandRunner, CommandSpec, LineSink},
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const MR_ADVISORY: &str = "WARNING: MR task selected. Ensure MR input.";

/// What to segment with. Only the fields of the chosen method are read:
/// `model` and `device` for Skellytour, `task` for TotalSegmentator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationSelection {
    pub method: Method,
    pub model: String,
    pub device: Device,
    pub task: String,
}

impl Default for SegmentationSelection {
    fn default() -> Self {
        Self {
            method: Method::Skellytour,
            model: "low".to_string(),
            device: Device::Gpu,
            task: String::new(),
        }
    }
}

impl SegmentationSelection {
    pub fn skellytour(model: impl Into<String>, device: Device) -> Self {
        Self {
            method: Method::Skellytour,
            model: model.into(),
            device,
            ..Self::default()
        }
    }

    pub fn total_segmentator(task: impl Into<String>) -> Self {
        Self {
            method: Method::TotalSegmentator,
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Maps a selection onto the command line of the matching tool.
#[derive(Debug, Clone)]
pub struct SegmentationDispatcher {
    skellytour: ToolCommand,
    totalsegmentator: ToolCommand,
    catalog: TaskCatalog,
}

impl Default for SegmentationDispatcher {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl SegmentationDispatcher {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            skellytour: config.skellytour.clone(),
            totalsegmentator: config.totalsegmentator.clone(),
            catalog: config.catalog,
        }
    }

    /// Reject selections that cannot be dispatched.
    ///
    /// Returns advisory messages that should be shown but do not block the
    /// run, such as running an MR task.
    pub fn validate(&self, selection: &SegmentationSelection) -> Result<Vec<String>> {
        let mut advisories = Vec::new();
        match selection.method {
            Method::Skellytour => {
                if selection.model.trim().is_empty() {
                    return Err(PipelineError::InvalidSelection(
                        "Select a Skellytour model".to_string(),
                    ));
                }
            }
            Method::TotalSegmentator => {
                let task = selection.task.trim();
                if task.is_empty() || self.catalog.is_placeholder(task) {
                    return Err(PipelineError::InvalidSelection(
                        "Select a valid TotalSegmentator task".to_string(),
                    ));
                }
                // The task also names the output folder, so only catalog entries pass.
                if !self.catalog.contains(task) {
                    return Err(PipelineError::InvalidSelection(format!(
                        "unknown TotalSegmentator task '{task}'"
                    )));
                }
                if is_mr_task(task) {
                    advisories.push(MR_ADVISORY.to_string());
                }
            }
        }
        Ok(advisories)
    }

    /// Directory the selected tool writes into.
    pub fn output_directory_for(
        &self,
        selection: &SegmentationSelection,
        output_directory: &Path,
    ) -> PathBuf {
        match selection.method {
            Method::Skellytour => output_directory.to_path_buf(),
            Method::TotalSegmentator => {
                output_directory.join(format!("segmentations_{}", selection.task.trim()))
            }
        }
    }

    pub fn command_for(
        &self,
        selection: &SegmentationSelection,
        volume_path: &Path,
        output_directory: &Path,
    ) -> CommandSpec {
        let target = self.output_directory_for(selection, output_directory);
        match selection.method {
            Method::Skellytour => self
                .skellytour
                .command()
                .arg("-i")
                .arg(volume_path)
                .arg("-o")
                .arg(target)
                .arg("-m")
                .arg(selection.model.trim())
                .arg("-d")
                .arg(selection.device.as_str())
                .arg("--overwrite"),
            Method::TotalSegmentator => self
                .totalsegmentator
                .command()
                .arg("-i")
                .arg(volume_path)
                .arg("-o")
                .arg(target)
                .arg("-ta")
                .arg(selection.task.trim()),
        }
    }

    /// Prepare the output location and run the selected tool through `runner`.
    pub async fn dispatch(
        &self,
        selection: &SegmentationSelection,
        volume_path: &Path,
        output_directory: &Path,
        runner: &dyn CommandRunner,
        cancel: &CancellationToken,
        on_line: LineSink<'_>,
    ) -> Result<()> {
        match selection.method {
            Method::Skellytour => on_line("Running Skellytour...".to_string()),
            Method::TotalSegmentator => on_line(format!(
                "Running TotalSegmentator (task: {})",
                selection.task.trim()
            )),
        }

        if selection.method == Method::TotalSegmentator {
            fs::create_dir_all(self.output_directory_for(selection, output_directory))?;
        }

        let spec = self.command_for(selection, volume_path, output_directory);
        info!(method = %selection.method, command = %spec, "Dispatching segmentation");
        runner.run(&spec, cancel, on_line).await
    }
}

use std::path::PathBuf;

use thiserror::Error;

use crate::enums::Stage;

/// Requirement that was not met when a stage was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("no DICOM source directory selected")]
    SourceDirectoryUnset,

    #[error("no output directory selected")]
    OutputDirectoryUnset,

    #[error("no converted volume available, run the DICOM conversion first")]
    VolumeUnset,

    #[error("a {0} run is already in progress")]
    Busy(Stage),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No DICOM series found in {}", directory.display())]
    NoSeriesFound { directory: PathBuf },

    #[error("Volume build failed: {0}")]
    VolumeBuild(String),

    #[error("{command} failed: {reason}")]
    ExecutionFailed { command: String, reason: String },

    #[error("Missing input: {0}")]
    Precondition(#[from] Precondition),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Errors that are rejected synchronously before any worker is spawned.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            PipelineError::Precondition(_) | PipelineError::InvalidSelection(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

//! # DICOM segmentation pipeline
//!
//! This crate turns a folder of DICOM slices into a single NIfTI volume and
//! then runs an external segmentation tool against that volume.
//!
//! A DICOM folder frequently interleaves several series (scouts, reformats,
//! contrast phases). The conversion stage groups the files by Series Instance
//! UID, picks the series with the most files, orders its slices along the
//! slice normal and writes `ct.nii.gz` into the output folder. The
//! segmentation stage then launches one of
//!  - Skellytour (`skellytour -i <volume> -o <out> -m <model> -d <device> --overwrite`)
//!  - TotalSegmentator (`TotalSegmentator -i <volume> -o <out>/segmentations_<task> -ta <task>`)
//!
//! and streams the tool's combined output line by line.
//!
//! The [`PipelineController`] sequences the two stages. It refuses to start
//! a segmentation before a volume exists and never runs two stages at once.
//! Stages run on background workers that report back over a channel, so
//! a presentation layer stays responsive while a tool runs for minutes.
//!
//! # Examples
//!
//! ## Converting a folder and segmenting it
//!
//! ```no_run
//! # use dicom_segmentation::{PipelineConfig, PipelineController, PipelineEvent, ProcessRunner, SegmentationSelection};
//! # use std::sync::Arc;
//! # async fn demo() {
//! let (mut controller, mut events) =
//!     PipelineController::new(Arc::new(PipelineConfig::default()), Arc::new(ProcessRunner));
//! controller.select_source_directory("dicom");
//! controller.select_output_directory("out");
//! controller.start_conversion().expect("folders are selected");
//! controller.settle().await;
//! controller
//!     .start_segmentation(SegmentationSelection::total_segmentator("total"))
//!     .expect("volume was converted");
//! controller.settle().await;
//! while let Ok(PipelineEvent::Log(line)) = events.try_recv() {
//!     println!("{}", line.text);
//! }
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod enums;
pub mod error;
pub mod nifti;
pub mod runner;
pub mod series;
pub mod volume;
pub mod volume_builder;
pub mod volume_loader;

pub use catalog::TaskCatalog;
pub use config::{PipelineConfig, ToolCommand};
pub use controller::{
    LogLine, PipelineController, PipelineEvent, PipelineState, StageFailure, UiCommand,
    run_controller,
};
pub use dispatcher::{SegmentationDispatcher, SegmentationSelection};
pub use enums::{Device, Method, SortBy, Stage};
pub use error::{PipelineError, Precondition};
pub use runner::{CommandRunner, CommandSpec, ProcessRunner};
pub use series::{SeriesDescriptor, SeriesIndex, select_best_series};
pub use volume::Volume;
pub use volume_builder::{ConversionJob, VolumeBuilder};

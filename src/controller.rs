//! Pipeline lifecycle controller.
//!
//! Owns the pipeline state, gates the two stages, and runs each stage on a
//! background worker. Workers never touch the state: they send log lines and
//! a completion message over a channel, and the controller applies them on
//! its own task. Presentation layers receive [`PipelineEvent`]s.

use crate::{
    config::PipelineConfig,
    dispatcher::{SegmentationDispatcher, SegmentationSelection},
    enums::Stage,
    error::{PipelineError, Precondition, Result},
    runner::CommandRunner,
    volume_builder::{ConversionJob, VolumeBuilder},
};

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One line of pipeline output. `seq` increases in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub seq: u64,
    pub text: String,
}

/// Events emitted for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Log(LogLine),
    /// A request was refused before any work started.
    Rejected { message: String },
    ConversionFinished { volume_path: Option<PathBuf> },
    SegmentationFinished { success: bool },
}

/// Commands sent by presentation layers.
#[derive(Debug, Clone)]
pub enum UiCommand {
    SelectSourceDirectory(PathBuf),
    SelectOutputDirectory(PathBuf),
    StartConversion,
    StartSegmentation(SegmentationSelection),
    Cancel,
    Quit,
}

/// The most recent failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub source_directory: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    /// Set once per successful conversion; required before segmentation.
    pub volume_path: Option<PathBuf>,
    pub stage: Stage,
    pub last_failure: Option<StageFailure>,
}

/// Messages from background workers.
#[derive(Debug)]
enum WorkerMessage {
    Log(String),
    ConversionFinished(Result<PathBuf>),
    SegmentationFinished(Result<()>),
}

pub struct PipelineController {
    state: PipelineState,
    config: Arc<PipelineConfig>,
    dispatcher: Arc<SegmentationDispatcher>,
    runner: Arc<dyn CommandRunner>,
    worker_tx: UnboundedSender<WorkerMessage>,
    worker_rx: UnboundedReceiver<WorkerMessage>,
    events: UnboundedSender<PipelineEvent>,
    next_seq: u64,
    cancel: Option<CancellationToken>,
}

impl PipelineController {
    pub fn new(
        config: Arc<PipelineConfig>,
        runner: Arc<dyn CommandRunner>,
    ) -> (Self, UnboundedReceiver<PipelineEvent>) {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            state: PipelineState::default(),
            dispatcher: Arc::new(SegmentationDispatcher::new(&config)),
            config,
            runner,
            worker_tx,
            worker_rx,
            events,
            next_seq: 0,
            cancel: None,
        };
        (controller, events_rx)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage
    }

    pub fn select_source_directory(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.log(format!("DICOM: {}", path.display()));
        self.state.source_directory = Some(path);
    }

    pub fn select_output_directory(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.log(format!("Output: {}", path.display()));
        self.state.output_directory = Some(path);
    }

    /// Use an existing volume file instead of converting one.
    pub fn adopt_volume(&mut self, path: &Path) -> Result<()> {
        self.ensure_idle()?;
        if !path.is_file() {
            return Err(Precondition::VolumeUnset.into());
        }
        let path = std::path::absolute(path)?;
        self.log(format!("NIfTI: {}", path.display()));
        self.state.volume_path = Some(path);
        self.state.stage = Stage::Converted;
        Ok(())
    }

    /// `Idle | Converted | Done -> Converting`.
    pub fn start_conversion(&mut self) -> Result<()> {
        self.ensure_idle()?;
        let source_directory = self
            .state
            .source_directory
            .clone()
            .ok_or(Precondition::SourceDirectoryUnset)?;
        let output_directory = self
            .state
            .output_directory
            .clone()
            .ok_or(Precondition::OutputDirectoryUnset)?;

        let job = ConversionJob {
            source_directory,
            output_directory,
            sort_by: self.config.sort_by,
            builder: VolumeBuilder::new(self.config.volume_file_name.clone()),
        };

        // The previous volume file is about to be replaced.
        self.state.volume_path = None;
        self.state.last_failure = None;
        self.transition(Stage::Converting);
        self.log("Converting DICOM → NIfTI...");

        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let log_tx = tx.clone();
            let worker = tokio::task::spawn_blocking(move || {
                job.run(&mut |line: String| {
                    let _ = log_tx.send(WorkerMessage::Log(line));
                })
            });
            let result = worker.await.unwrap_or_else(|e| {
                Err(PipelineError::VolumeBuild(format!(
                    "conversion worker stopped: {e}"
                )))
            });
            let _ = tx.send(WorkerMessage::ConversionFinished(result));
        });
        Ok(())
    }

    /// `Converted | Done -> Segmenting`. Fails fast without a volume.
    pub fn start_segmentation(&mut self, selection: SegmentationSelection) -> Result<()> {
        self.ensure_idle()?;
        let volume_path = self
            .state
            .volume_path
            .clone()
            .ok_or(Precondition::VolumeUnset)?;
        let output_directory = self
            .state
            .output_directory
            .clone()
            .ok_or(Precondition::OutputDirectoryUnset)?;

        for advisory in self.dispatcher.validate(&selection)? {
            self.log(advisory);
        }

        self.state.last_failure = None;
        self.transition(Stage::Segmenting);
        self.log("Starting segmentation...");

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let tx = self.worker_tx.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            let log_tx = tx.clone();
            let worker = tokio::spawn(async move {
                let mut on_line = move |line: String| {
                    let _ = log_tx.send(WorkerMessage::Log(line));
                };
                dispatcher
                    .dispatch(
                        &selection,
                        &volume_path,
                        &output_directory,
                        runner.as_ref(),
                        &cancel,
                        &mut on_line,
                    )
                    .await
            });
            let result = worker.await.unwrap_or_else(|e| {
                Err(PipelineError::ExecutionFailed {
                    command: "segmentation worker".to_string(),
                    reason: e.to_string(),
                })
            });
            let _ = tx.send(WorkerMessage::SegmentationFinished(result));
        });
        Ok(())
    }

    /// Request cancellation of the running segmentation. Returns whether
    /// there was one to cancel.
    pub fn cancel(&mut self) -> bool {
        match (&self.cancel, self.state.stage) {
            (Some(token), Stage::Segmenting) => {
                token.cancel();
                self.log("Cancelling segmentation...");
                true
            }
            _ => false,
        }
    }

    /// Apply one presentation-layer command. Refused requests are reported
    /// as events rather than returned.
    pub fn apply(&mut self, command: UiCommand) {
        let outcome = match command {
            UiCommand::SelectSourceDirectory(path) => {
                self.select_source_directory(path);
                Ok(())
            }
            UiCommand::SelectOutputDirectory(path) => {
                self.select_output_directory(path);
                Ok(())
            }
            UiCommand::StartConversion => self.start_conversion(),
            UiCommand::StartSegmentation(selection) => self.start_segmentation(selection),
            UiCommand::Cancel => {
                self.cancel();
                Ok(())
            }
            UiCommand::Quit => Ok(()),
        };

        if let Err(e) = outcome {
            self.reject(e);
        }
    }

    /// Wait for the next worker message and apply it.
    pub async fn step(&mut self) {
        if let Some(message) = self.worker_rx.recv().await {
            self.handle_worker_message(message);
        }
    }

    /// Apply worker messages until no stage is running.
    pub async fn settle(&mut self) {
        while self.state.stage.is_busy() {
            self.step().await;
        }
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Log(line) => self.log(line),
            WorkerMessage::ConversionFinished(Ok(volume_path)) => {
                self.state.volume_path = Some(volume_path.clone());
                self.transition(Stage::Converted);
                self.log("NIfTI conversion done.");
                self.emit(PipelineEvent::ConversionFinished {
                    volume_path: Some(volume_path),
                });
            }
            WorkerMessage::ConversionFinished(Err(e)) => {
                self.fail(Stage::Converting, &e);
                self.transition(Stage::Idle);
                self.log("NIfTI conversion failed.");
                self.emit(PipelineEvent::ConversionFinished { volume_path: None });
            }
            WorkerMessage::SegmentationFinished(Ok(())) => {
                self.cancel = None;
                self.transition(Stage::Done);
                self.log("Done.");
                self.emit(PipelineEvent::SegmentationFinished { success: true });
            }
            WorkerMessage::SegmentationFinished(Err(e)) => {
                self.cancel = None;
                self.fail(Stage::Segmenting, &e);
                self.transition(Stage::Converted);
                self.log("Segmentation failed.");
                self.emit(PipelineEvent::SegmentationFinished { success: false });
            }
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state.stage.is_busy() {
            return Err(Precondition::Busy(self.state.stage).into());
        }
        Ok(())
    }

    fn transition(&mut self, stage: Stage) {
        info!(from = %self.state.stage, to = %stage, "Pipeline stage changed");
        self.state.stage = stage;
    }

    fn fail(&mut self, stage: Stage, e: &PipelineError) {
        error!(%stage, error = %e, "Pipeline stage failed");
        self.log(format!("ERROR: {e}"));
        self.state.last_failure = Some(StageFailure {
            stage,
            message: e.to_string(),
        });
    }

    fn reject(&mut self, e: PipelineError) {
        warn!(error = %e, "Request refused");
        let level = if e.is_advisory() { "WARNING" } else { "ERROR" };
        self.log(format!("{level}: {e}"));
        self.emit(PipelineEvent::Rejected {
            message: e.to_string(),
        });
    }

    fn log(&mut self, text: impl Into<String>) {
        let line = LogLine {
            seq: self.next_seq,
            text: text.into(),
        };
        self.next_seq += 1;
        self.emit(PipelineEvent::Log(line));
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

/// Drive `controller` from presentation-layer commands until `Quit` (or the
/// command channel closing). A running segmentation is cancelled on quit and
/// a running conversion is allowed to finish.
pub async fn run_controller(
    mut controller: PipelineController,
    mut commands: UnboundedReceiver<UiCommand>,
) -> PipelineState {
    let mut quit_pending = false;

    loop {
        tokio::select! {
            command = commands.recv(), if !quit_pending => match command {
                Some(UiCommand::Quit) | None => {
                    quit_pending = true;
                    if !controller.cancel() && !controller.stage().is_busy() {
                        break;
                    }
                }
                Some(command) => controller.apply(command),
            },
            Some(message) = controller.worker_rx.recv() => {
                controller.handle_worker_message(message);
                if quit_pending && !controller.stage().is_busy() {
                    break;
                }
            }
        }
    }

    controller.state
}

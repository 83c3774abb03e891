use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dicom_segmentation::{
    Device, Method, PipelineConfig, PipelineController, PipelineEvent, ProcessRunner,
    SegmentationSelection, UiCommand, run_controller,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dicom-segmentation")]
#[command(about = "Convert a DICOM folder to NIfTI and run a segmentation tool on it")]
#[command(version)]
struct Cli {
    /// TOML file overriding tool commands and conversion settings
    #[arg(long, global = true, env = "DICOM_SEGMENTATION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert the largest DICOM series of a folder to <output>/ct.nii.gz
    Convert {
        /// Folder containing the DICOM files
        #[arg(short, long)]
        dicom: PathBuf,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Segment an existing NIfTI volume
    Segment {
        /// NIfTI volume to segment
        #[arg(short, long)]
        volume: PathBuf,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Convert a DICOM folder, then segment the resulting volume
    Run {
        /// Folder containing the DICOM files
        #[arg(short, long)]
        dicom: PathBuf,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// List the TotalSegmentator tasks, grouped
    Tasks,
}

#[derive(Args, Debug)]
struct SelectionArgs {
    /// Segmentation method: skellytour or totalsegmentator
    #[arg(long, default_value = "skellytour")]
    method: Method,

    /// Skellytour model
    #[arg(long, default_value = "low", value_parser = ["low", "medium", "high"])]
    model: String,

    /// Skellytour device: gpu or cpu
    #[arg(long, default_value = "gpu")]
    device: Device,

    /// TotalSegmentator task, e.g. total or total_mr (see `tasks`)
    #[arg(long)]
    task: Option<String>,
}

impl From<SelectionArgs> for SegmentationSelection {
    fn from(args: SelectionArgs) -> Self {
        Self {
            method: args.method,
            model: args.model,
            device: args.device,
            task: args.task.unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dicom_segmentation=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Arc::new(
        PipelineConfig::resolve(cli.config.as_deref()).context("Failed to load configuration")?,
    );

    let (mut controller, mut events) =
        PipelineController::new(Arc::clone(&config), Arc::new(ProcessRunner));
    let mut commands = Vec::new();
    let mut follow_up: Option<SegmentationSelection> = None;

    match cli.command {
        Command::Convert { dicom, output } => {
            commands.push(UiCommand::SelectSourceDirectory(dicom));
            commands.push(UiCommand::SelectOutputDirectory(output));
            commands.push(UiCommand::StartConversion);
        }
        Command::Segment {
            volume,
            output,
            selection,
        } => {
            controller.select_output_directory(output);
            controller
                .adopt_volume(&volume)
                .with_context(|| format!("Cannot use volume {}", volume.display()))?;
            commands.push(UiCommand::StartSegmentation(selection.into()));
        }
        Command::Run {
            dicom,
            output,
            selection,
        } => {
            commands.push(UiCommand::SelectSourceDirectory(dicom));
            commands.push(UiCommand::SelectOutputDirectory(output));
            commands.push(UiCommand::StartConversion);
            follow_up = Some(selection.into());
        }
        Command::Tasks => {
            for entry in config.catalog.entries() {
                println!("{entry}");
            }
            return Ok(());
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(run_controller(controller, cmd_rx));
    for command in commands {
        let _ = cmd_tx.send(command);
    }

    let mut succeeded = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PipelineEvent::Log(line)) => println!("{}", line.text),
                Some(PipelineEvent::Rejected { .. }) => {
                    succeeded = false;
                    let _ = cmd_tx.send(UiCommand::Quit);
                }
                Some(PipelineEvent::ConversionFinished { volume_path }) => {
                    match (volume_path, follow_up.take()) {
                        (Some(_), Some(selection)) => {
                            let _ = cmd_tx.send(UiCommand::StartSegmentation(selection));
                        }
                        (Some(_), None) => {
                            let _ = cmd_tx.send(UiCommand::Quit);
                        }
                        (None, _) => {
                            succeeded = false;
                            let _ = cmd_tx.send(UiCommand::Quit);
                        }
                    }
                }
                Some(PipelineEvent::SegmentationFinished { success }) => {
                    succeeded &= success;
                    let _ = cmd_tx.send(UiCommand::Quit);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                succeeded = false;
                let _ = cmd_tx.send(UiCommand::Quit);
            }
        }
    }

    let state = driver.await.context("Controller task failed")?;
    if !succeeded {
        match state.last_failure {
            Some(failure) => bail!("{} stage failed: {}", failure.stage, failure.message),
            None => bail!("Pipeline did not complete"),
        }
    }
    Ok(())
}

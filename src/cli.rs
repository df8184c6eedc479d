use crate::allow_list::AllowList;
use crate::capture::NokhwaBackend;
use crate::config::{load_config, save_config, Config};
use crate::display::{install_interrupt_handler, DirectoryRender};
use crate::ipc::{send_command, socket_path, spawn_console_reader, ControlListener, ControlMessage};
use crate::lifecycle::Lifecycle;
use crate::pipeline::{Pipeline, PipelineError, PipelineSettings, RunReport};
use crate::summary::{format_summary, ConsoleSurface};
use crate::yolo::YoloDetector;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::unbounded;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "multicam-tally",
    version,
    about = "Count distinct objects seen by several cameras"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture and counting pipeline
    Run(RunArgs),
    /// Reset the counts of a running pipeline
    Reset,
    /// Stop a running pipeline
    Quit,
    /// Persist default settings
    Config(ConfigArgs),
}

/// Overrides for the stored configuration.
#[derive(Args, Debug, Default, PartialEq)]
pub struct RunArgs {
    /// Camera index to open (repeatable)
    #[arg(short, long = "camera")]
    pub cameras: Vec<u32>,
    /// File with one allowed class name per line
    #[arg(long)]
    pub allow_list: Option<PathBuf>,
    /// Directory receiving the latest annotated frame per camera
    #[arg(long)]
    pub frames_dir: Option<PathBuf>,
    /// Summary refresh interval in milliseconds
    #[arg(long)]
    pub refresh_ms: Option<u64>,
    /// ONNX model file, or file name inside the model repository
    #[arg(long)]
    pub model: Option<String>,
    /// Hugging Face repository to download the model from
    #[arg(long)]
    pub model_repo: Option<String>,
    /// Minimum class score for a detection
    #[arg(long)]
    pub confidence: Option<f32>,
}

impl RunArgs {
    pub fn apply(self, mut cfg: Config) -> Config {
        if !self.cameras.is_empty() {
            cfg.cameras = self.cameras;
        }
        if let Some(path) = self.allow_list {
            cfg.allow_list = path;
        }
        if let Some(dir) = self.frames_dir {
            cfg.frames_dir = dir;
        }
        if let Some(ms) = self.refresh_ms {
            cfg.refresh_ms = ms;
        }
        if let Some(model) = self.model {
            cfg.model = model;
        }
        if let Some(repo) = self.model_repo {
            cfg.model_repo = repo;
        }
        if let Some(confidence) = self.confidence {
            cfg.confidence = confidence;
        }
        cfg
    }
}

#[derive(Args, Debug, Default, PartialEq)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub run: RunArgs,
}

pub fn run_cli() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    execute(cli)
}

/// Runs a parsed command and returns the process exit code.
pub fn execute(cli: Cli) -> i32 {
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Reset => control(ControlMessage::Reset),
        Commands::Quit => control(ControlMessage::Quit),
        Commands::Config(args) => {
            let cfg = args.run.apply(load_config());
            save_config(&cfg);
            info!(cameras = ?cfg.cameras, "configuration saved");
            0
        }
    }
}

fn control(msg: ControlMessage) -> i32 {
    match send_command(msg) {
        Ok(()) => {
            info!(?msg, "command sent");
            0
        }
        Err(e) => {
            error!(path = %socket_path().display(), "pipeline not reachable: {e}");
            1
        }
    }
}

fn run(args: RunArgs) -> i32 {
    let cfg = args.apply(load_config());
    let result = run_with_config(&cfg);
    if let Ok(report) = &result {
        println!("{}", format_summary(&report.final_counts));
    }
    exit_code(&result)
}

/// Maps the outcome of a pipeline run to the process exit code: 0 once the
/// user quit, 1 when no camera opened or startup failed.
pub fn exit_code(result: &anyhow::Result<RunReport>) -> i32 {
    match result {
        Ok(report) => {
            info!(cameras = report.active.len(), "exiting");
            0
        }
        Err(e) => {
            if let Some(PipelineError::NoSources) = e.downcast_ref::<PipelineError>() {
                error!("no cameras available");
            } else {
                error!("{e:#}");
            }
            1
        }
    }
}

fn run_with_config(cfg: &Config) -> anyhow::Result<RunReport> {
    let allow_list = AllowList::load(&cfg.allow_list)?;
    let detector = YoloDetector::load(&cfg.model, &cfg.model_repo, cfg.confidence, cfg.iou)
        .context("failed to load detection model")?;
    let interrupts = install_interrupt_handler().context("failed to install Ctrl-C handler")?;
    let render = DirectoryRender::new(&cfg.frames_dir, interrupts)?;

    let lifecycle = Lifecycle::new();
    let (commands_tx, commands_rx) = unbounded();
    let control = match ControlListener::bind(&socket_path()) {
        Ok(listener) => Some(listener.spawn(commands_tx.clone(), lifecycle.clone())?),
        Err(e) => {
            error!("control socket unavailable, console commands only: {e}");
            None
        }
    };
    spawn_console_reader(commands_tx)?;

    let pipeline = Pipeline::new(NokhwaBackend, Arc::new(detector), allow_list, lifecycle.clone());
    let result = pipeline.run(
        &PipelineSettings::from(cfg),
        render,
        ConsoleSurface::default(),
        &commands_rx,
    );
    lifecycle.stop();
    if let Some(handle) = control {
        let _ = handle.join();
    }
    Ok(result?)
}

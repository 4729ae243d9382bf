use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "lectern")]
#[command(version, about = "Turn long lecture videos into quizzes, one segment at a time")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines. Overrides lectern.toml.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a lectern project in the current directory
    Init,
    /// Register a course and split it into segments
    Ingest {
        #[arg(long)]
        title: String,
        /// Reference the analysis provider uses to fetch the video
        #[arg(long)]
        video_ref: String,
        /// Video duration in seconds
        #[arg(long)]
        duration: f64,
        /// Segment length in seconds. Defaults to lectern.toml
        #[arg(long)]
        segment_length: Option<f64>,
    },
    /// Process a course from its first segment and drain the dispatch queue
    Run {
        course_id: String,
        #[arg(long, env = "LECTERN_WORKER_ID")]
        worker: Option<String>,
        /// Stop after this many dispatch tasks
        #[arg(long, default_value = "1000")]
        max_steps: usize,
    },
    /// Claim and process one segment, then continue the chain
    Claim {
        segment_id: String,
        #[arg(long, env = "LECTERN_WORKER_ID")]
        worker: Option<String>,
    },
    /// Evaluate the completion gate for a course
    Finalize { course_id: String },
    /// Show segments, plans and progress for a course (all courses if omitted)
    Status {
        course_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default lectern.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config =
        lectern::config::LecternConfig::with_cli_args(project_dir, cli.verbose, cli.json_logs)?;
    let _log_guard = lectern::logging::init(&lectern::logging::LogSettings::from_config(&config))?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config).await?,
        Commands::Ingest {
            title,
            video_ref,
            duration,
            segment_length,
        } => cmd::cmd_ingest(&config, title, video_ref, *duration, *segment_length).await?,
        Commands::Run {
            course_id,
            worker,
            max_steps,
        } => cmd::cmd_run(&config, course_id, worker.as_deref(), *max_steps).await?,
        Commands::Claim { segment_id, worker } => {
            cmd::cmd_claim(&config, segment_id, worker.as_deref()).await?
        }
        Commands::Finalize { course_id } => cmd::cmd_finalize(&config, course_id).await?,
        Commands::Status { course_id, json } => {
            cmd::cmd_status(&config, course_id.as_deref(), *json).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}

//! Lantern - replay and inspect agent sessions
//!
//! - `lantern replay` drives the session core from a JSONL event script and
//!   prints every channel event as a JSON line
//! - `lantern check-command` asks the plan-mode shell gate about a command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lantern_core::plan::{PlanPolicy, ShellDecision};
use lantern_core::{paths, CoreConfig};

mod replay;

/// Lantern - session event core tools
#[derive(Parser)]
#[command(name = "lantern")]
#[command(about = "Replay and inspect Lantern agent sessions", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.lantern/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working directory for sessions (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL event script through the session core
    ///
    /// Each line is `{"type": ..., "data": ..., "session": "work"|"plan"}`.
    /// Runtime event types are emitted by the targeted session; `lantern.*`
    /// types drive the controller (send, enter_plan, present_plan,
    /// accept_plan, reject_plan, exit_plan, abort, invoke_tool).
    Replay {
        /// Script to replay
        #[arg(required_unless_present = "session")]
        script: Option<PathBuf>,

        /// Replay the recorded event log of this session from the state dir
        #[arg(long, conflicts_with = "script")]
        session: Option<String>,

        /// Resume this session id instead of creating one
        #[arg(long)]
        resume: Option<String>,

        /// How long to wait for the relay to drain after the last line
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
    },

    /// Check a shell command against the plan-mode shell gate
    CheckCommand {
        /// Command line as the agent would run it
        command: String,
    },
}

fn init_logging() {
    let log_dir = paths::logs_dir();
    let log_file = std::fs::create_dir_all(&log_dir)
        .and_then(|_| std::fs::File::create(log_dir.join("lantern.log")));

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    // stdout carries replay output, so logs go to the file or stderr
    match log_file {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init(),
        Err(e) => {
            eprintln!("Failed to create log file: {}, logging to stderr", e);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn load_config(cli: &Cli) -> Result<CoreConfig> {
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::load_default()?,
    };

    let working_dir = match &cli.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    Ok(config.with_working_dir(absolute(&working_dir)?))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to read current directory")?
        .join(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Replay {
            script,
            session,
            resume,
            settle_ms,
        } => {
            let script = match (script, session) {
                (Some(script), _) => script,
                (None, Some(id)) => paths::event_log(&config.state_dir, &id),
                (None, None) => anyhow::bail!("Nothing to replay"),
            };
            tracing::info!(script = %script.display(), "Starting replay");
            replay::run(config, &script, resume.as_deref(), settle_ms).await?;
        }
        Commands::CheckCommand { command } => {
            let policy = PlanPolicy::new(&config.plan, &config.working_dir);
            match policy.check_shell(&command) {
                ShellDecision::Allowed => println!("allowed"),
                ShellDecision::Denied { reason } => {
                    println!("denied: {}", reason);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use termagent_config::{AppConfig, ExecTarget, TelemetryConfig};
use termagent_exec::{ExecChunk, ExecStatus, ToolExecutor};

#[derive(Debug, Parser)]
#[command(
    name = "termagent",
    version,
    about = "A terminal coding agent that plans, searches and runs commands"
)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve /chat and /sse (the default).
    Serve,
    /// Serve POST /execute from inside the isolated environment.
    SandboxApi,
    /// Run one command through the safety guard and sandbox.
    Exec {
        command: String,
        /// Run inside the isolated environment instead of on the host.
        #[arg(long)]
        isolated: bool,
        /// Seconds before the command is killed (0 disables the limit).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Report whether the safety guard would allow a command.
    Check { command: String },
    /// Back up a workspace file and apply a unified diff to it.
    Patch {
        file: PathBuf,
        #[arg(value_name = "PATCH_FILE")]
        patch_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_tracing(&config.telemetry)?;
    tracing::debug!(config = %cli.config.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => termagent_runtime::run_server(config).await?,
        Commands::SandboxApi => termagent_runtime::run_sandbox_api(config).await?,
        Commands::Exec {
            command,
            isolated,
            timeout,
        } => {
            let target = isolated.then_some(ExecTarget::Isolated);
            run_exec(&config, &command, target, timeout).await?;
        }
        Commands::Check { command } => {
            let executor = ToolExecutor::from_config(&config)?;
            match executor.guard().check(&command) {
                Ok(()) => println!("allowed: {command}"),
                Err(violation) => bail!("{violation}"),
            }
        }
        Commands::Patch { file, patch_file } => {
            let executor = ToolExecutor::from_config(&config)?;
            let patch = std::fs::read_to_string(&patch_file)
                .with_context(|| format!("read patch file {}", patch_file.display()))?;
            let outcome = executor.apply_patch(&file, &patch).await?;
            if let Some(backup) = &outcome.backup {
                println!("backup: {}", backup.backup_path.display());
            }
            if !outcome.applied {
                bail!(
                    "patch not applied; hunks that did not match: {:?}",
                    outcome.hunks_failed
                );
            }
            println!("patched {}", file.display());
        }
    }
    Ok(())
}

async fn run_exec(
    config: &AppConfig,
    command: &str,
    target: Option<ExecTarget>,
    timeout: Option<u64>,
) -> Result<()> {
    let executor = ToolExecutor::from_config(config)?;
    let mut output = executor.shell(command, target, timeout)?;

    let mut result = None;
    while let Some(chunk) = output.next().await {
        match chunk {
            ExecChunk::Line { text, .. } => println!("{text}"),
            ExecChunk::Finished(finished) => result = Some(finished),
        }
    }
    let Some(result) = result else {
        bail!("command ended without a result");
    };
    eprintln!("{}", result.summary_line());
    match result.status {
        ExecStatus::Completed if result.returncode == 0 => Ok(()),
        ExecStatus::Completed => std::process::exit(result.returncode),
        status => bail!("command {status:?}: {}", result.stderr.trim()),
    }
}

/// Stderr logging, plus daily-rolled `agent.log` files when `log_dir` is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(telemetry: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match telemetry.log_dir.as_deref() {
        Some(dir) if !dir.trim().is_empty() => {
            std::fs::create_dir_all(dir).with_context(|| format!("create log dir {dir}"))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "agent.log"));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(guard)
}

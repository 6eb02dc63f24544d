//! Command-line entry point for the K.A.R.I. orchestrator daemon.

mod modules;
mod shutdown;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kari_core::{LoadReport, Orchestrator, OrchestratorConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Env var switching log output to JSON.
const LOG_JSON_ENV: &str = "KARI_LOG_JSON";

/// K.A.R.I. - modular orchestrator daemon with a heartbeat and a control socket.
#[derive(Parser, Debug)]
#[command(name = "kari")]
#[command(author, version, long_about = None)]
#[command(about = "K.A.R.I. - modular orchestrator daemon with a heartbeat and a control socket.")]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the orchestrator and run until Ctrl+C or SIGTERM.
    Serve {
        /// Config file (defaults to ./kari.toml when present).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Control socket path.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Pulse interval in seconds.
        #[arg(long)]
        interval: Option<f64>,
        /// Start with debug enabled.
        #[arg(long)]
        debug: bool,
        /// Start with trace enabled.
        #[arg(long)]
        trace: bool,
        /// Do not open the control socket.
        #[arg(long)]
        no_socket: bool,
    },
    /// Send one command line to a running daemon and print the response.
    Send {
        /// Command words, e.g. `call "Voice Box" say`.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
        /// Control socket path.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Config file used to locate the socket.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Load every module once, print the load report and exit.
    Check {
        /// Config file (defaults to ./kari.toml when present).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve {
            config,
            socket,
            interval,
            debug,
            trace,
            no_socket,
        } => {
            let mut config = OrchestratorConfig::load(config.as_deref())?;
            if let Some(socket) = socket {
                config.socket.path = socket;
            }
            if let Some(interval) = interval {
                config.pulse_interval_secs = interval;
            }
            config.debug |= debug;
            config.trace |= trace;
            if no_socket {
                config.socket.enabled = false;
            }
            config.validate()?;
            run_server(config).await
        }
        Command::Send {
            words,
            socket,
            config,
        } => send_line(&words, socket, config.as_deref()).await,
        Command::Check { config, json } => check_modules(config.as_deref(), json),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(LOG_JSON_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("kari={level},kari_core={level}"))
            .add_directive(tracing::Level::WARN.into())
    });

    // Logs go to stderr so `send` and `check` output stays machine-readable.
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_server(config: OrchestratorConfig) -> Result<ExitCode> {
    let core = Orchestrator::new(config, modules::catalog());
    core.load_modules().context("Failed to load modules")?;

    let signal_core = Arc::clone(&core);
    tokio::spawn(async move {
        shutdown::shutdown_signal().await;
        signal_core.request_shutdown();
    });

    core.run().await?;
    tracing::info!(category = "core", "Goodbye");
    Ok(ExitCode::SUCCESS)
}

/// Socket to talk to: explicit path, else the configured path, else the
/// configured fallback when only that one exists.
fn resolve_socket(socket: Option<PathBuf>, config: Option<&Path>) -> Result<PathBuf> {
    if let Some(socket) = socket {
        return Ok(socket);
    }
    let config = OrchestratorConfig::load(config)?;
    if !config.socket.path.exists() && config.socket.fallback_path.exists() {
        return Ok(config.socket.fallback_path);
    }
    Ok(config.socket.path)
}

async fn send_line(words: &[String], socket: Option<PathBuf>, config: Option<&Path>) -> Result<ExitCode> {
    let path = resolve_socket(socket, config)?;
    let line = words.iter().map(|w| quote_word(w)).collect::<Vec<_>>().join(" ");

    let stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("Failed to connect to {}", path.display()))?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{line}\n").as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    let response = lines
        .next_line()
        .await?
        .context("Connection closed without a response")?;

    let value: Value = serde_json::from_str(&response)
        .with_context(|| format!("Malformed response: {response}"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

/// Re-quote a shell word so the daemon splits it back the same way.
fn quote_word(word: &str) -> String {
    if !word.is_empty() && !word.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\') {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn check_modules(config: Option<&Path>, json: bool) -> Result<ExitCode> {
    let mut config = OrchestratorConfig::load(config)?;
    config.socket.enabled = false;

    let core = Orchestrator::new(config, modules::catalog());
    let report = core.load_modules().context("Failed to load modules")?;
    let ready = core
        .registry()
        .snapshot()
        .iter()
        .filter(|m| m.is_ready())
        .count();

    if json {
        let mut value = serde_json::to_value(&report)?;
        if let Value::Object(map) = &mut value {
            map.insert("ready".to_string(), ready.into());
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_report(&report, ready);
    }

    core.shutdown_modules();
    Ok(if report.failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_report(report: &LoadReport, ready: usize) {
    println!("Attached ({}):", report.attached.len());
    for name in &report.attached {
        println!("  {name}");
    }
    if !report.preloaded.is_empty() {
        println!("Preloaded ({}): {}", report.preloaded.len(), report.preloaded.join(", "));
    }
    if !report.failures.is_empty() {
        println!("Failed ({}):", report.failures.len());
        for failure in &report.failures {
            println!("  {} [{}]: {}", failure.unit, failure.kind, failure.message);
        }
    }
    println!("{}/{} modules responsive", ready, report.attached.len());
}

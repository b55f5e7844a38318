#![forbid(unsafe_code)]

//! `qga-exec` — run a command inside a QEMU guest via the guest agent.
//!
//! Connects to the guest-agent device, launches the command with
//! `guest-exec`, streams stdout/stderr to the local streams as polls drain
//! them, and exits with the guest process's exit code. Failure classes map
//! to distinct local exit codes so scripts can branch on them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, EnvFilter};

use qga_exec::config::GlobalConfig;
use qga_exec::rpc::RpcClient;
use qga_exec::session::{ExecSession, ExecSpec, OutputChunk, StreamKind};
use qga_exec::{transport, AppError, Result};

/// Local exit code for protocol, agent, or encoding failures.
const EXIT_PROTOCOL: u8 = 123;
/// Local exit code when the execution deadline expires.
const EXIT_TIMEOUT: u8 = 124;
/// Local exit code for transport failures.
const EXIT_TRANSPORT: u8 = 125;
/// Local exit code when the agent rejects the launch.
const EXIT_LAUNCH: u8 = 126;
/// Local exit code for configuration or usage errors.
const EXIT_USAGE: u8 = 2;
/// Local exit code when interrupted (shell convention for SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "qga-exec",
    about = "Run commands inside QEMU guests over the guest-agent channel",
    version,
    long_about = None
)]
struct Cli {
    /// Guest-agent device path (Unix socket, character device, or pipe).
    #[arg(long)]
    device: Option<PathBuf>,

    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest environment entry; repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Stdin source for the guest process; `-` reads local stdin to EOF.
    /// The whole input is sent with the launch: the agent protocol has no
    /// streaming-stdin RPC.
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Execution deadline in seconds; 0 disables. On expiry the remote
    /// process is left running — the protocol has no kill RPC.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Per-RPC reply timeout in seconds.
    #[arg(long, value_name = "SECS")]
    rpc_timeout: Option<u64>,

    /// Skip the guest-sync channel handshake.
    #[arg(long)]
    no_sync: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Command path in the guest, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("qga-exec: {err}");
        return ExitCode::from(EXIT_USAGE);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(guest_code) => ExitCode::from(guest_code),
        Err(err) => {
            error!(%err, "qga-exec failed");
            ExitCode::from(failure_code(&err))
        }
    }
}

async fn run(args: Cli) -> Result<u8> {
    // ── Configuration ───────────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };

    let device = args
        .device
        .clone()
        .or_else(|| config.device.clone())
        .ok_or_else(|| AppError::Config("no device path given (use --device)".into()))?;

    let call_timeout = args
        .rpc_timeout
        .map_or_else(|| config.timeouts.call_timeout(), Duration::from_secs);
    let deadline = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.timeouts.exec_deadline(),
    };

    for entry in &args.env {
        if !entry.contains('=') {
            return Err(AppError::Config(format!(
                "env entry '{entry}' is not KEY=VALUE"
            )));
        }
    }

    let mut command = args.command.clone();
    let path = command.remove(0);
    let spec = ExecSpec {
        path,
        args: command,
        env: args.env.clone(),
        input: read_input(args.input.as_deref()).await?,
    };

    // ── Channel setup ───────────────────────────────────
    let channel = transport::connect(&device).await?;
    let mut rpc = RpcClient::new(channel, call_timeout);
    if !args.no_sync {
        rpc.sync().await?;
    }

    let mut session = ExecSession::new(rpc, config.poll.clone());

    // Stream guest output to the local streams as polls return it.
    let (chunk_tx, chunk_rx) = mpsc::channel::<OutputChunk>(64);
    session.set_chunk_channel(chunk_tx);
    let writer = tokio::spawn(write_chunks(chunk_rx));

    // Cooperative cancellation on Ctrl-C; checked between polls, so an
    // in-flight read is never interrupted.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let outcome = session.run(&spec, deadline, &cancel).await;

    // Dropping the session closes the chunk channel and lets the writer
    // drain before we report the result.
    drop(session);
    let _ = writer.await;

    let result = outcome?;
    if result.truncated {
        warn!("guest output was truncated by the agent's buffer cap; lost bytes are unrecoverable");
    }

    Ok(local_exit_code(result.exit_code))
}

/// Read the guest stdin source: a file, `-` for local stdin, or nothing.
async fn read_input(source: Option<&std::path::Path>) -> Result<Vec<u8>> {
    match source {
        None => Ok(Vec::new()),
        Some(path) if path.as_os_str() == "-" => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .map_err(|err| AppError::Io(format!("failed to read stdin: {err}")))?;
            Ok(buf)
        }
        Some(path) => tokio::fs::read(path)
            .await
            .map_err(|err| AppError::Io(format!("failed to read {}: {err}", path.display()))),
    }
}

/// Copy decoded output chunks to the local stdout/stderr until the channel
/// closes.
async fn write_chunks(mut rx: mpsc::Receiver<OutputChunk>) {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(chunk) = rx.recv().await {
        let written = match chunk.stream {
            StreamKind::Stdout => stdout.write_all(&chunk.data).await,
            StreamKind::Stderr => stderr.write_all(&chunk.data).await,
        };
        if let Err(err) = written {
            warn!(%err, "failed to write guest output locally");
            break;
        }
    }

    let _ = stdout.flush().await;
    let _ = stderr.flush().await;
}

/// Map the guest exit code to a local process exit code.
///
/// A negative code is the signal sentinel from the session; it maps to
/// `128 + signal` (shell convention). Codes above 255 are truncated to
/// their low byte, as Unix wait status would.
fn local_exit_code(guest_code: i64) -> u8 {
    if guest_code < 0 {
        let signal = guest_code.unsigned_abs().min(127);
        return 128 + u8::try_from(signal).unwrap_or(127);
    }
    u8::try_from(guest_code & 0xff).unwrap_or(255)
}

/// Map a failure class to its distinct local exit code.
fn failure_code(err: &AppError) -> u8 {
    match err {
        AppError::ExecTimeout(_) => EXIT_TIMEOUT,
        AppError::Transport(_) | AppError::TransportTimeout(_) => EXIT_TRANSPORT,
        AppError::Launch { .. } => EXIT_LAUNCH,
        AppError::Protocol(_) | AppError::Agent { .. } | AppError::Encoding(_) => EXIT_PROTOCOL,
        AppError::Cancelled => EXIT_INTERRUPTED,
        AppError::Config(_) | AppError::Io(_) => EXIT_USAGE,
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    // Logs go to stderr; stdout belongs to the guest process's output.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

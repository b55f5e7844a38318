//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// None of these are retried inside the core: retry safety depends on RPC
/// idempotency the client cannot assume (re-launching after an ambiguous
/// failure could spawn a duplicate process in the guest). Every failure is
/// surfaced to the caller as a distinguishable variant.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// I/O failure on the guest-agent channel. Fatal to the session.
    Transport(String),
    /// Read timeout while waiting for a reply record. Fatal to the session;
    /// the channel may hold a half-received record and must not be reused.
    TransportTimeout(String),
    /// Malformed or unexpected-shape record on the wire. Indicates a
    /// protocol or agent-version mismatch rather than a guest-side failure.
    Protocol(String),
    /// Structured error object returned by the agent, surfaced verbatim.
    Agent {
        /// Agent error class (e.g. `GenericError`, `CommandNotFound`).
        class: String,
        /// Human-readable description from the agent.
        desc: String,
    },
    /// Agent rejected the `guest-exec` launch itself.
    Launch {
        /// Agent error class reported for the launch.
        class: String,
        /// Human-readable description from the agent.
        desc: String,
    },
    /// Caller-supplied deadline expired before the guest process exited.
    ///
    /// The guest-agent protocol has no kill RPC for exec sessions, so the
    /// remote process is left running in the guest.
    ExecTimeout(String),
    /// Malformed base64 in an output chunk. Treated as a protocol violation.
    Encoding(String),
    /// Cooperative cancellation observed between poll iterations.
    Cancelled,
    /// Local file-system or stdio I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::TransportTimeout(msg) => write!(f, "transport timeout: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Agent { class, desc } => write!(f, "agent error [{class}]: {desc}"),
            Self::Launch { class, desc } => write!(f, "launch failed [{class}]: {desc}"),
            Self::ExecTimeout(msg) => {
                write!(f, "execution timeout: {msg} (remote process left running)")
            }
            Self::Encoding(msg) => write!(f, "encoding: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

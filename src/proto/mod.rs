//! QEMU Guest Agent wire protocol.
//!
//! Request and response shapes for the `guest-exec`, `guest-exec-status`,
//! and `guest-sync` RPCs, plus the record codec that frames the raw channel
//! byte stream into complete JSON records (see [`codec`]).
//!
//! The wire format is one JSON object per request or response with no
//! length prefixes; record boundaries are JSON object boundaries. Requests
//! are written with a trailing `\n`, which the agent ignores as
//! inter-record whitespace.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

// ── Requests ──────────────────────────────────────────────────────────────────

/// A single guest-agent RPC request. Immutable once built; one per call.
#[derive(Debug, Clone, Serialize)]
pub struct QgaRequest {
    /// RPC name (e.g. `guest-exec`).
    pub execute: String,
    /// RPC arguments object; omitted from the wire when the RPC takes none.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl QgaRequest {
    /// Build a `guest-exec` launch request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the arguments fail to serialize
    /// (cannot happen for well-formed [`GuestExecArgs`]).
    pub fn guest_exec(args: &GuestExecArgs) -> Result<Self> {
        let arguments = serde_json::to_value(args)
            .map_err(|e| AppError::Protocol(format!("guest-exec arguments: {e}")))?;
        Ok(Self {
            execute: "guest-exec".to_owned(),
            arguments,
        })
    }

    /// Build a `guest-exec-status` poll request for `pid`.
    #[must_use]
    pub fn guest_exec_status(pid: i64) -> Self {
        Self {
            execute: "guest-exec-status".to_owned(),
            arguments: serde_json::json!({ "pid": pid }),
        }
    }

    /// Build a `guest-sync` handshake request carrying `id`.
    #[must_use]
    pub fn guest_sync(id: i64) -> Self {
        Self {
            execute: "guest-sync".to_owned(),
            arguments: serde_json::json!({ "id": id }),
        }
    }
}

/// Encode a request as one self-delimited JSON record, `\n`-terminated.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialization fails.
pub fn encode_request(request: &QgaRequest) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(request)
        .map_err(|e| AppError::Protocol(format!("failed to serialize request: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Arguments for the `guest-exec` RPC, in the agent's hyphenated spelling.
#[derive(Debug, Clone, Serialize)]
pub struct GuestExecArgs {
    /// Executable path inside the guest.
    pub path: String,
    /// Argument vector (not including the path).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arg: Vec<String>,
    /// Environment entries as `KEY=VALUE` strings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Complete initial stdin, base64-encoded. The protocol has no
    /// chunked-stdin RPC, so the whole input travels with the launch.
    #[serde(rename = "input-data", skip_serializing_if = "Option::is_none")]
    pub input_data: Option<String>,
    /// Whether the agent should buffer stdout/stderr for later polls.
    #[serde(rename = "capture-output")]
    pub capture_output: bool,
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Structured error object returned by the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentFailure {
    /// Agent error class (e.g. `GenericError`).
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}

/// One decoded guest-agent reply: exactly one of `return` or `error`.
#[derive(Debug)]
pub enum QgaResponse {
    /// The RPC succeeded; carries the raw `return` value.
    Success(Value),
    /// The agent reported a structured failure.
    Failure(AgentFailure),
}

/// Decode one complete JSON record into a [`QgaResponse`].
///
/// Rejects records that carry both, or neither, of `return`/`error` with
/// [`AppError::Protocol`], so callers can tell "agent said no" from
/// "garbage on the wire".
///
/// # Errors
///
/// Returns [`AppError::Protocol`] for invalid JSON or a reply that does
/// not match the response schema.
pub fn decode_response(record: &str) -> Result<QgaResponse> {
    #[derive(Deserialize)]
    struct RawResponse {
        #[serde(rename = "return")]
        ret: Option<Value>,
        error: Option<AgentFailure>,
    }

    let raw: RawResponse = serde_json::from_str(record)
        .map_err(|e| AppError::Protocol(format!("malformed response record: {e}")))?;

    match (raw.ret, raw.error) {
        (Some(value), None) => Ok(QgaResponse::Success(value)),
        (None, Some(failure)) => Ok(QgaResponse::Failure(failure)),
        (Some(_), Some(_)) => Err(AppError::Protocol(
            "response carries both `return` and `error`".into(),
        )),
        (None, None) => Err(AppError::Protocol(
            "response carries neither `return` nor `error`".into(),
        )),
    }
}

/// Handle to a launched guest process.
///
/// Valid only between a successful launch and the first status reply with
/// `exited=true`; the agent does not guarantee pid reuse safety beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ExecHandle {
    /// Guest-side process identifier.
    pub pid: i64,
}

impl ExecHandle {
    /// Extract the handle from a `guest-exec` return value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the return value lacks a `pid`.
    pub fn from_return(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("unexpected guest-exec return shape: {e}")))
    }
}

/// One `guest-exec-status` reply.
///
/// `out_data`/`err_data` are *cumulative-since-last-poll* base64 chunks,
/// not running totals: the session appends decoded chunks, never replaces.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecStatus {
    /// Whether the guest process has exited.
    pub exited: bool,
    /// Exit code, present once exited normally.
    pub exitcode: Option<i64>,
    /// Terminating signal number, present when killed by a signal.
    pub signal: Option<i64>,
    /// Base64 stdout chunk produced since the previous poll.
    #[serde(rename = "out-data")]
    pub out_data: Option<String>,
    /// Base64 stderr chunk produced since the previous poll.
    #[serde(rename = "err-data")]
    pub err_data: Option<String>,
    /// Whether stdout bytes were lost to the agent's buffer cap.
    #[serde(rename = "out-truncated", default)]
    pub out_truncated: bool,
    /// Whether stderr bytes were lost to the agent's buffer cap.
    #[serde(rename = "err-truncated", default)]
    pub err_truncated: bool,
}

impl ExecStatus {
    /// Extract the status from a `guest-exec-status` return value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the return value does not match
    /// the status schema.
    pub fn from_return(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            AppError::Protocol(format!("unexpected guest-exec-status return shape: {e}"))
        })
    }
}

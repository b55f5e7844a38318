#![forbid(unsafe_code)]

//! Host-side command execution for QEMU guests over the guest-agent
//! channel.
//!
//! Turns the agent's asynchronous `guest-exec` / `guest-exec-status`
//! request/poll/base64 model into a synchronous, streaming, Unix-like
//! execution abstraction: launch a command, stream its stdout/stderr as
//! polls drain it, and collect an exit status.

pub mod config;
pub mod errors;
pub mod iobuf;
pub mod proto;
pub mod rpc;
pub mod session;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};

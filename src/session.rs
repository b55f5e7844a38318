//! Execution session: one remote command from launch to completion.
//!
//! Bridges the agent's request/poll/base64 model into a synchronous,
//! process-like abstraction. The session owns its [`RpcClient`] and its
//! output accumulators exclusively; polls for a handle are strictly
//! sequential, never concurrent.
//!
//! State machine:
//!
//! ```text
//! INIT -> (launch RPC succeeds) -> RUNNING -> (poll: exited=false) -> RUNNING
//! RUNNING -> (poll: exited=true) -> DONE
//! INIT -> (launch RPC fails) -> FAILED
//! RUNNING -> (poll fails / transport error) -> FAILED
//! ```
//!
//! DONE and FAILED are terminal.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::iobuf::{self, OutputAccumulator};
use crate::proto::{ExecHandle, ExecStatus, GuestExecArgs, QgaRequest, QgaResponse};
use crate::rpc::RpcClient;
use crate::{AppError, Result};

// ── Public types ──────────────────────────────────────────────────────────────

/// What to run in the guest.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    /// Executable path inside the guest.
    pub path: String,
    /// Argument vector (not including the path).
    pub args: Vec<String>,
    /// Environment entries as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Complete initial stdin. The protocol has no way to feed stdin after
    /// launch, so this is the whole input, encoded in full before the call.
    pub input: Vec<u8>,
}

/// Which guest stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Guest process standard output.
    Stdout,
    /// Guest process standard error.
    Stderr,
}

/// One decoded output chunk, forwarded to a streaming consumer as polls
/// return it.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Stream the chunk belongs to.
    pub stream: StreamKind,
    /// Decoded bytes, in poll-arrival order.
    pub data: Bytes,
}

/// Lifecycle state of a session. DONE and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No launch issued yet.
    Init,
    /// Launched; polling for completion.
    Running,
    /// The guest process exited and the result was assembled.
    Done,
    /// A launch, poll, or transport failure ended the session.
    Failed,
}

/// Final aggregate for one completed command. Immutable; returned once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Guest exit code. A signal termination with no exit code maps to the
    /// negated signal number, distinguishable from any normal exit.
    pub exit_code: i64,
    /// Complete decoded stdout, chunks concatenated in poll order.
    pub stdout: Vec<u8>,
    /// Complete decoded stderr, chunks concatenated in poll order.
    pub stderr: Vec<u8>,
    /// Whether the agent reported lost bytes on either stream.
    pub truncated: bool,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Drives one remote command's full lifecycle over an exclusive channel.
#[derive(Debug)]
pub struct ExecSession<T> {
    rpc: RpcClient<T>,
    poll_config: PollConfig,
    state: SessionState,
    handle: Option<ExecHandle>,
    stdout: OutputAccumulator,
    stderr: OutputAccumulator,
    chunk_tx: Option<mpsc::Sender<OutputChunk>>,
}

impl<T> ExecSession<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    /// Create a session owning `rpc` with the given poll schedule.
    pub fn new(rpc: RpcClient<T>, poll_config: PollConfig) -> Self {
        Self {
            rpc,
            poll_config,
            state: SessionState::Init,
            handle: None,
            stdout: OutputAccumulator::new(),
            stderr: OutputAccumulator::new(),
            chunk_tx: None,
        }
    }

    /// Forward decoded output chunks through `tx` as polls return them, in
    /// addition to accumulating. A dropped receiver stops forwarding but
    /// does not fail the session.
    pub fn set_chunk_channel(&mut self, tx: mpsc::Sender<OutputChunk>) {
        self.chunk_tx = Some(tx);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Launch the guest process described by `spec`.
    ///
    /// Non-empty stdin is base64-encoded in full and attached to the
    /// launch request; there is no mechanism to feed stdin afterwards.
    ///
    /// # Errors
    ///
    /// - [`AppError::Launch`] — the agent rejected the launch; carries the
    ///   agent's class and description verbatim. No poll is ever issued.
    /// - Transport and protocol errors from the underlying call.
    pub async fn launch(&mut self, spec: &ExecSpec) -> Result<ExecHandle> {
        if self.state != SessionState::Init {
            return Err(AppError::Protocol(format!(
                "launch called in state {:?}",
                self.state
            )));
        }

        let args = GuestExecArgs {
            path: spec.path.clone(),
            arg: spec.args.clone(),
            env: spec.env.clone(),
            input_data: (!spec.input.is_empty()).then(|| iobuf::encode_all(&spec.input)),
            capture_output: true,
        };
        let request = QgaRequest::guest_exec(&args)?;

        match self.rpc.call(&request).await {
            Ok(QgaResponse::Success(value)) => {
                let handle = ExecHandle::from_return(value).map_err(|err| self.fail(err))?;
                info!(path = %spec.path, pid = handle.pid, "guest process launched");
                self.handle = Some(handle);
                self.state = SessionState::Running;
                Ok(handle)
            }
            Ok(QgaResponse::Failure(failure)) => {
                warn!(path = %spec.path, class = %failure.class, desc = %failure.desc,
                    "guest-exec rejected");
                Err(self.fail(AppError::Launch {
                    class: failure.class,
                    desc: failure.desc,
                }))
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Issue one `guest-exec-status` poll for the held handle.
    ///
    /// Decodes any output chunks, appends them to the accumulators in
    /// arrival order, forwards them to the chunk channel, and records
    /// truncation. On `exited=true` the session transitions to DONE.
    ///
    /// # Errors
    ///
    /// Any transport, protocol, agent, or encoding failure; all terminate
    /// the session in FAILED.
    pub async fn poll(&mut self) -> Result<ExecStatus> {
        if self.state != SessionState::Running {
            return Err(AppError::Protocol(format!(
                "poll called in state {:?}",
                self.state
            )));
        }
        let Some(handle) = self.handle else {
            return Err(self.fail(AppError::Protocol("poll without a live handle".into())));
        };

        let request = QgaRequest::guest_exec_status(handle.pid);
        let status = match self.rpc.call(&request).await {
            Ok(QgaResponse::Success(value)) => {
                ExecStatus::from_return(value).map_err(|err| self.fail(err))?
            }
            Ok(QgaResponse::Failure(failure)) => {
                return Err(self.fail(AppError::Agent {
                    class: failure.class,
                    desc: failure.desc,
                }));
            }
            Err(err) => return Err(self.fail(err)),
        };

        if let Some(encoded) = status.out_data.as_deref() {
            let chunk = iobuf::decode_chunk(encoded).map_err(|err| self.fail(err))?;
            self.stdout.push(chunk.clone());
            self.forward(StreamKind::Stdout, chunk).await;
        }
        if let Some(encoded) = status.err_data.as_deref() {
            let chunk = iobuf::decode_chunk(encoded).map_err(|err| self.fail(err))?;
            self.stderr.push(chunk.clone());
            self.forward(StreamKind::Stderr, chunk).await;
        }
        if status.out_truncated {
            self.stdout.mark_truncated();
        }
        if status.err_truncated {
            self.stderr.mark_truncated();
        }

        if status.exited {
            debug!(pid = handle.pid, exitcode = ?status.exitcode, signal = ?status.signal,
                "guest process exited");
            self.state = SessionState::Done;
            self.handle = None;
        }

        Ok(status)
    }

    /// Run `spec` to completion: launch, then poll with exponential
    /// back-off until the process exits, `deadline` expires, or `cancel`
    /// fires.
    ///
    /// Cancellation is cooperative: the token is checked before each poll
    /// and raced against the back-off sleep, never interrupting an
    /// in-flight read (a half-received record would corrupt framing).
    ///
    /// # Errors
    ///
    /// - [`AppError::ExecTimeout`] — `deadline` expired; the remote
    ///   process is left running (the protocol has no kill RPC).
    /// - [`AppError::Cancelled`] — `cancel` fired between polls.
    /// - Any launch or poll failure.
    pub async fn run(
        &mut self,
        spec: &ExecSpec,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let started = Instant::now();
        self.launch(spec).await?;

        let mut interval = self.poll_config.initial();
        loop {
            if cancel.is_cancelled() {
                return Err(self.fail(AppError::Cancelled));
            }
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    return Err(self.fail(AppError::ExecTimeout(format!(
                        "guest process still running after {}s",
                        limit.as_secs_f64()
                    ))));
                }
            }

            let status = self.poll().await?;
            if status.exited {
                return self.assemble(&status);
            }

            // Never sleep past the deadline; the expiry check at the top of
            // the loop fires on the next iteration.
            let sleep_for = deadline.map_or(interval, |limit| {
                interval.min(limit.saturating_sub(started.elapsed()))
            });

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    return Err(self.fail(AppError::Cancelled));
                }
                () = tokio::time::sleep(sleep_for) => {}
            }

            interval = self.poll_config.next(interval);
        }
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    /// Build the final [`CommandResult`] from the accumulators and the
    /// terminal status.
    fn assemble(&self, status: &ExecStatus) -> Result<CommandResult> {
        let exit_code = match (status.exitcode, status.signal) {
            (Some(code), _) => code,
            // Signal termination with no exit code: negate the signal so
            // callers can tell it apart from any normal exit.
            (None, Some(signal)) => -signal,
            (None, None) => {
                return Err(AppError::Protocol(
                    "process exited with neither exitcode nor signal".into(),
                ));
            }
        };

        Ok(CommandResult {
            exit_code,
            stdout: self.stdout.to_bytes(),
            stderr: self.stderr.to_bytes(),
            truncated: self.stdout.is_truncated() || self.stderr.is_truncated(),
        })
    }

    /// Transition to FAILED and hand the error back for propagation.
    fn fail(&mut self, err: AppError) -> AppError {
        self.state = SessionState::Failed;
        self.handle = None;
        err
    }

    async fn forward(&mut self, stream: StreamKind, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if let Some(tx) = &self.chunk_tx {
            if tx.send(OutputChunk { stream, data }).await.is_err() {
                debug!("chunk receiver dropped; streaming disabled");
                self.chunk_tx = None;
            }
        }
    }
}

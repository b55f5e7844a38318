//! RPC correlator for the guest-agent channel.
//!
//! The channel is a raw byte stream with no multiplexing, so correlation is
//! by exclusivity rather than by tagging: [`RpcClient::call`] writes the
//! full encoded request before reading, and the next complete decoded
//! record *is* the response. One request is in flight at a time — enforced
//! by `&mut self`, so the borrow checker guarantees release on every exit
//! path, including decode failures.
//!
//! A read timeout surfaces [`AppError::TransportTimeout`] and is never
//! retried here: retry policy belongs to the session, which knows whether
//! re-issuing the specific RPC is safe.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

use crate::proto::codec::RecordCodec;
use crate::proto::{self, QgaRequest, QgaResponse};
use crate::{AppError, Result};

/// Default per-call reply timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Stale records tolerated while waiting for the `guest-sync` reply.
const SYNC_SKIP_LIMIT: usize = 32;

/// Exclusive client for one guest-agent channel.
///
/// Owns both halves of the duplex stream; a single channel must never be
/// shared by two concurrent clients (the agent's behavior under
/// interleaved requests is undefined).
#[derive(Debug)]
pub struct RpcClient<T> {
    reader: FramedRead<ReadHalf<T>, RecordCodec>,
    writer: WriteHalf<T>,
    call_timeout: Duration,
}

impl<T> RpcClient<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    /// Wrap an already-open duplex channel.
    pub fn new(channel: T, call_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(channel);
        Self {
            reader: FramedRead::new(reader, RecordCodec::new()),
            writer,
            call_timeout,
        }
    }

    /// Send one request and wait for the matching reply record.
    ///
    /// # Errors
    ///
    /// - [`AppError::Transport`] — the write or read failed, or the peer
    ///   closed the channel.
    /// - [`AppError::TransportTimeout`] — no complete reply arrived within
    ///   the configured call timeout.
    /// - [`AppError::Protocol`] — the reply record is malformed.
    pub async fn call(&mut self, request: &QgaRequest) -> Result<QgaResponse> {
        self.send(request).await?;
        let record = self.next_record().await?;
        trace!(execute = %request.execute, len = record.len(), "reply record received");
        proto::decode_response(&record)
    }

    /// Synchronize the channel before the first real RPC.
    ///
    /// Sends `guest-sync` with a random id and discards records until the
    /// matching integer reply arrives. This flushes stale replies left on
    /// the device by earlier clients; without it the first call after
    /// attach can pair with a leftover record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the matching reply never arrives
    /// within [`SYNC_SKIP_LIMIT`] records, or any transport error from the
    /// underlying reads. A stale *partial* record still breaks framing and
    /// is fatal; this handshake only discards whole records.
    pub async fn sync(&mut self) -> Result<()> {
        let id = i64::from(rand::random::<u32>());
        let request = QgaRequest::guest_sync(id);
        self.send(&request).await?;

        for _ in 0..SYNC_SKIP_LIMIT {
            let record = self.next_record().await?;
            match proto::decode_response(&record) {
                Ok(QgaResponse::Success(value)) if value.as_i64() == Some(id) => {
                    debug!(id, "guest-sync complete");
                    return Ok(());
                }
                Ok(_) => {
                    debug!("guest-sync: discarding stale record");
                }
                Err(err) => {
                    debug!(%err, "guest-sync: discarding undecodable record");
                }
            }
        }

        Err(AppError::Protocol(format!(
            "guest-sync id {id} not acknowledged within {SYNC_SKIP_LIMIT} records"
        )))
    }

    async fn send(&mut self, request: &QgaRequest) -> Result<()> {
        let bytes = proto::encode_request(request)?;
        trace!(execute = %request.execute, len = bytes.len(), "sending request record");
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| AppError::Transport(format!("write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AppError::Transport(format!("flush failed: {e}")))?;
        Ok(())
    }

    async fn next_record(&mut self) -> Result<String> {
        match tokio::time::timeout(self.call_timeout, self.reader.next()).await {
            Err(_) => Err(AppError::TransportTimeout(format!(
                "no reply within {}s",
                self.call_timeout.as_secs_f64()
            ))),
            Ok(None) => Err(AppError::Transport("channel closed by peer".into())),
            Ok(Some(Err(err))) => Err(err),
            Ok(Some(Ok(record))) => Ok(record),
        }
    }
}

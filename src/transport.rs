//! Transport acquisition for the guest-agent device.
//!
//! Produces an already-open duplex byte stream to the device QEMU exposes
//! for the guest agent: a Unix domain socket (`-chardev socket`), a
//! virtio-serial character device node, or a Windows named pipe. The core
//! never discovers device paths itself; the CLI passes one in.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{AppError, Result};

/// Duplex byte stream to the guest agent. Reads may return fewer bytes
/// than requested; framing is the codec's concern, not the transport's.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed channel returned by [`connect`].
pub type GuestChannel = Box<dyn Channel>;

/// Open the guest-agent device at `path`.
///
/// On Unix the path is stat-ed: sockets connect via
/// [`tokio::net::UnixStream`], anything else (virtio-serial device nodes,
/// FIFOs) opens read+write as a [`tokio::fs::File`].
///
/// # Errors
///
/// Returns [`AppError::Transport`] if the device cannot be opened.
#[cfg(unix)]
pub async fn connect(path: &Path) -> Result<GuestChannel> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = tokio::fs::metadata(path).await.map_err(|err| {
        AppError::Transport(format!("cannot stat device {}: {err}", path.display()))
    })?;

    if metadata.file_type().is_socket() {
        let stream = tokio::net::UnixStream::connect(path).await.map_err(|err| {
            AppError::Transport(format!("cannot connect to {}: {err}", path.display()))
        })?;
        Ok(Box::new(stream))
    } else {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|err| {
                AppError::Transport(format!("cannot open device {}: {err}", path.display()))
            })?;
        Ok(Box::new(file))
    }
}

/// Open the guest-agent device at `path`.
///
/// On Windows the path names a pipe (e.g. `\\.\pipe\qga`), connected via
/// the `interprocess` local-socket stream.
///
/// # Errors
///
/// Returns [`AppError::Transport`] if the pipe cannot be opened.
#[cfg(windows)]
pub async fn connect(path: &Path) -> Result<GuestChannel> {
    use interprocess::local_socket::{tokio::prelude::*, GenericFilePath};

    let name = path
        .as_os_str()
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| {
            AppError::Transport(format!("invalid pipe name {}: {err}", path.display()))
        })?;
    let stream = interprocess::local_socket::tokio::Stream::connect(name)
        .await
        .map_err(|err| {
            AppError::Transport(format!("cannot connect to {}: {err}", path.display()))
        })?;
    Ok(Box::new(stream))
}

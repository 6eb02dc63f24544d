//! Unix domain socket listener for the control protocol.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::handle_line;
use super::protocol::ControlResponse;
use crate::config::SocketConfig;
use crate::error::{ControlError, CoreError};
use crate::orchestrator::Orchestrator;

/// Longest request line accepted, newline excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket described by `config`.
    ///
    /// Falls back to `fallback_path` when the parent of `path` cannot be
    /// created. A stale socket file is removed first and `mode` is applied
    /// after binding.
    pub fn bind(config: &SocketConfig) -> Result<Self, CoreError> {
        let path = prepare_path(&config.path, &config.fallback_path);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| CoreError::Bind {
                path: path.clone(),
                source,
            })?;
        }
        let listener = UnixListener::bind(&path).map_err(|source| CoreError::Bind {
            path: path.clone(),
            source,
        })?;
        if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.mode)) {
            warn!(category = "control", path = %path.display(), error = %e, "Could not set socket permissions");
        }
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    /// file and drop any open sessions.
    pub async fn serve<F>(self, core: Arc<Orchestrator>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let core = Arc::clone(&core);
                        sessions.spawn(handle_connection(core, stream));
                    }
                    Err(e) => {
                        warn!(category = "control", error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            warn!(category = "control", "Control session panicked");
                        }
                    }
                }
            }
        }

        sessions.abort_all();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(category = "control", path = %self.path.display(), error = %e, "Socket file already gone");
        }
        info!(category = "control", "Control socket closed");
    }
}

/// One framed read from a control session.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    TooLong,
    Eof,
}

/// Read up to the next `\n`. Bytes that are not UTF-8 are replaced rather
/// than failing the session; a line over [`MAX_LINE_BYTES`] is discarded.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_LINE_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_BYTES {
        skip_line(reader).await?;
        return Ok(Frame::TooLong);
    }
    let text = String::from_utf8_lossy(buf);
    Ok(Frame::Line(text.trim_end_matches(['\r', '\n']).to_string()))
}

/// Drop everything up to and including the next `\n`.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Serve one client: every line read gets exactly one response line.
pub async fn handle_connection(core: Arc<Orchestrator>, stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let response = match read_frame(&mut reader, &mut buf).await {
            Ok(Frame::Line(line)) => handle_line(&core, &line).await,
            Ok(Frame::TooLong) => {
                debug!(category = "control", limit = MAX_LINE_BYTES, "Control line too long");
                ControlResponse::failure(ControlError::bad_arguments(format!(
                    "Line exceeds {MAX_LINE_BYTES} bytes"
                )))
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                debug!(category = "control", error = %e, "Control session read failed");
                break;
            }
        };
        if let Err(e) = writer.write_all(response.to_line().as_bytes()).await {
            debug!(category = "control", error = %e, "Control session write failed");
            break;
        }
    }
}

fn prepare_path(primary: &Path, fallback: &Path) -> PathBuf {
    match primary.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => match std::fs::create_dir_all(parent) {
            Ok(()) => primary.to_path_buf(),
            Err(e) => {
                warn!(
                    category = "control",
                    path = %primary.display(),
                    fallback = %fallback.display(),
                    error = %e,
                    "Cannot create socket directory, using fallback"
                );
                fallback.to_path_buf()
            }
        },
        _ => primary.to_path_buf(),
    }
}

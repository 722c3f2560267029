//! Child process ownership and framed byte streams.
//!
//! The transport knows nothing about the protocol beyond frame boundaries:
//! it turns outgoing [`RpcMessage`]s into frames on the child's stdin and
//! incoming frames on the child's stdout into [`TransportEvent`]s, in
//! arrival order.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::protocol::{self, RpcMessage, MAX_FRAME_LEN};

/// Events the transport delivers to the session.
#[derive(Debug)]
pub enum TransportEvent {
    /// One decoded frame, in wire order.
    Frame(RpcMessage),
    /// The stream ended. Emitted exactly once; no frames follow it.
    Disconnected,
}

/// The embedded editor child process.
pub struct EditorProcess {
    child: Child,
}

impl EditorProcess {
    /// Spawn the editor with stdin/stdout piped and stderr inherited so its
    /// diagnostics land in the parent's terminal.
    pub fn spawn(
        command: &str,
        args: &[String],
    ) -> Result<(Self, ChildStdin, ChildStdout), BridgeError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BridgeError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Spawn {
            command: command.to_string(),
            source: std::io::Error::other("child stdin was not captured"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Spawn {
            command: command.to_string(),
            source: std::io::Error::other("child stdout was not captured"),
        })?;

        Ok((Self { child }, stdin, stdout))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Ask the kernel to kill the child. The resulting pipe close drives the
    /// normal disconnect path.
    pub fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Send half of the framed link. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    outgoing: mpsc::UnboundedSender<RpcMessage>,
    closed: Arc<AtomicBool>,
}

impl Transport {
    /// Wire a reader/writer pair into a framed transport.
    ///
    /// Generic over the streams so tests can drive the link through
    /// in-memory pipes instead of a real child process.
    pub fn attach<R, W>(reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_task(
            writer,
            outgoing_rx,
            events_tx.clone(),
            closed.clone(),
        ));
        tokio::spawn(reader_task(reader, events_tx, closed.clone()));

        (Self { outgoing, closed }, events_rx)
    }

    /// Queue one message for the wire.
    pub fn send(&self, msg: RpcMessage) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ConnectionClosed);
        }
        self.outgoing
            .send(msg)
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<RpcMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = outgoing.recv().await {
        let frame = match protocol::encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping unencodable outgoing message: {}", err);
                continue;
            }
        };
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            // A broken write half ends the connection even while the read
            // half is still open: queued requests were lost, so pending
            // calls must be drained rather than left hanging.
            signal_disconnect(&events, &closed);
            return;
        }
    }
    closed.store(true, Ordering::Release);
}

async fn reader_task<R: AsyncRead + Unpin>(
    reader: R,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(reader);

    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }
        if len > MAX_FRAME_LEN {
            log::warn!("frame payload too large ({} bytes), skipping", len);
            // Drain the oversized body to keep the stream in sync.
            let mut remaining = len;
            let mut discard = vec![0u8; 8192];
            let mut failed = false;
            while remaining > 0 {
                let take = remaining.min(discard.len());
                match reader.read_exact(&mut discard[..take]).await {
                    Ok(_) => remaining -= take,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                break;
            }
            continue;
        }

        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }

        match protocol::decode(&body) {
            Ok(msg) => {
                if events.send(TransportEvent::Frame(msg)).is_err() {
                    break;
                }
            }
            // A single bad frame is not fatal; the length prefix already
            // kept the stream aligned on the next frame.
            Err(err) => log::warn!("discarding malformed frame: {}", err),
        }
    }

    signal_disconnect(&events, &closed);
}

/// Mark the transport closed and emit `Disconnected` exactly once, whichever
/// half fails first.
fn signal_disconnect(events: &mpsc::UnboundedSender<TransportEvent>, closed: &AtomicBool) {
    if !closed.swap(true, Ordering::AcqRel) {
        let _ = events.send(TransportEvent::Disconnected);
    }
}

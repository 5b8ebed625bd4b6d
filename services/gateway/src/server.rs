//! TCP ingestion: accept loop and one supervisor task per scale connection.
//!
//! # Connection protocol
//! 1. Frames are newline-delimited; CR, LF and CRLF all terminate a frame,
//!    empty frames are ignored.
//! 2. The first non-empty frame must be a registration (`SCALE-NN`) and
//!    must arrive within a short grace window; anything else closes the
//!    connection.
//! 3. Heartbeats bump the device's heartbeat clock; events go through the
//!    parser into the event processor; unknown frames are logged and
//!    dropped.
//! 4. A frame longer than `MAX_FRAME_BYTES` closes the connection with a
//!    protocol error.
//!
//! A second connection registering an already-connected device displaces
//! the older socket: the registry swaps handles and the old task is told
//! to close.  On any exit path the task detaches its own socket slot
//! (conn_id-guarded, so a displaced task cannot clear its successor).

use crate::events::EventProcessor;
use crate::registry::DeviceRegistry;
use scale_protocol::{Frame, MAX_FRAME_BYTES, parse_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long a fresh connection may take to produce its registration frame.
const REGISTRATION_GRACE: Duration = Duration::from_secs(10);

/// Read chunk size; frames are tiny, connections are many.
const READ_CHUNK: usize = 1024;

/// Unparseable frames seen since startup, across all connections.
static MALFORMED_FRAMES: AtomicU64 = AtomicU64::new(0);

/// Observability counter for malformed frames.
pub fn malformed_frame_count() -> u64 {
    MALFORMED_FRAMES.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct ScaleServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventProcessor>,
}

impl ScaleServer {
    pub async fn bind(
        host: &str,
        port: u16,
        registry: Arc<DeviceRegistry>,
        events: Arc<EventProcessor>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        info!(addr = %listener.local_addr()?, "scale TCP server listening");
        Ok(ScaleServer {
            listener,
            registry,
            events,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop.  Each accepted socket gets its own supervisor task;
    /// shutdown cancels the accepts and the per-connection close signals
    /// take care of live sockets.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scale TCP server shutting down");
                        return;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "scale connection accepted");
                        let registry = Arc::clone(&self.registry);
                        let events = Arc::clone(&self.events);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            run_connection(stream, peer, registry, events, shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection supervisor
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ReadOutcome {
    Frame(String),
    Eof,
    Oversize,
    Io(std::io::Error),
}

/// Buffered newline framing over a raw socket.
///
/// Both `\r` and `\n` terminate a frame; a CRLF pair therefore yields the
/// frame plus one empty frame, and empty frames are skipped by the caller.
struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        FrameReader { buf: Vec::new() }
    }

    /// Pop one complete frame from the buffer, if present.
    ///
    /// Returns `Err(())` when the frame under construction has already
    /// exceeded the protocol cap.
    fn pop_frame(&mut self) -> Result<Option<String>, ()> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
            if pos > MAX_FRAME_BYTES {
                return Err(());
            }
            let frame: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
            return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
        }
        if self.buf.len() > MAX_FRAME_BYTES {
            return Err(());
        }
        Ok(None)
    }

    /// Read until one complete non-empty frame is available.
    async fn next_frame(&mut self, stream: &mut TcpStream) -> ReadOutcome {
        loop {
            match self.pop_frame() {
                Err(()) => return ReadOutcome::Oversize,
                Ok(Some(frame)) => {
                    if frame.trim().is_empty() {
                        continue;
                    }
                    return ReadOutcome::Frame(frame);
                }
                Ok(None) => {}
            }

            let mut chunk = [0u8; READ_CHUNK];
            match stream.read(&mut chunk).await {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) => return ReadOutcome::Io(e),
            }
        }
    }
}

async fn run_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let source_ip = peer.ip().to_string();
    let mut reader = FrameReader::new();

    // Registration phase: the first non-empty frame binds the socket.
    let device_id = tokio::select! {
        biased;
        _ = shutdown.changed() => return,
        first = tokio::time::timeout(REGISTRATION_GRACE, reader.next_frame(&mut stream)) => {
            match first {
                Err(_) => {
                    warn!(peer = %peer, "no registration within grace window, closing");
                    return;
                }
                Ok(ReadOutcome::Frame(line)) => match parse_frame(&line) {
                    Frame::Registration { device_id } => device_id,
                    other => {
                        warn!(peer = %peer, frame = ?other, "first frame is not a registration, closing");
                        return;
                    }
                },
                Ok(ReadOutcome::Eof) => return,
                Ok(ReadOutcome::Oversize) => {
                    warn!(peer = %peer, "oversized frame before registration, closing");
                    return;
                }
                Ok(ReadOutcome::Io(e)) => {
                    warn!(peer = %peer, error = %e, "read error before registration");
                    return;
                }
            }
        }
    };

    if let Err(e) = registry.register(&device_id, &source_ip).await {
        warn!(device_id, error = %e, "failed to persist device registration, closing");
        return;
    }

    let (handle, mut close_rx) = registry.new_connection_handle();
    let conn_id = handle.conn_id;
    if let Some(previous) = registry.attach_socket(&device_id, handle).await {
        info!(device_id, "newer connection displaces the old socket");
        previous.signal_close();
    }
    info!(device_id, peer = %peer, conn_id, "scale registered");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    debug!(device_id, conn_id, "connection told to close");
                    break;
                }
            }
            outcome = reader.next_frame(&mut stream) => match outcome {
                ReadOutcome::Frame(line) => {
                    handle_frame(&device_id, &source_ip, &line, &registry, &events).await;
                }
                ReadOutcome::Eof => {
                    debug!(device_id, "scale closed the connection");
                    break;
                }
                ReadOutcome::Oversize => {
                    warn!(device_id, "frame exceeds {MAX_FRAME_BYTES} bytes, closing with protocol error");
                    break;
                }
                ReadOutcome::Io(e) => {
                    warn!(device_id, error = %e, "socket read error");
                    break;
                }
            },
        }
    }

    // The task owns only its own slot; a displaced predecessor must not
    // clear its successor's socket.
    if let Err(e) = registry.detach_socket(&device_id, conn_id).await {
        warn!(device_id, error = %e, "failed to persist disconnect");
    }
}

async fn handle_frame(
    device_id: &str,
    source_ip: &str,
    line: &str,
    registry: &DeviceRegistry,
    events: &EventProcessor,
) {
    match parse_frame(line) {
        Frame::Heartbeat => {
            if let Err(e) = registry.record_heartbeat(device_id).await {
                warn!(device_id, error = %e, "failed to persist heartbeat");
            }
        }
        Frame::Event(record) => {
            if let Err(e) = events.capture(device_id, source_ip, &record, line).await {
                // Event is dropped; the stream keeps its order.
                warn!(device_id, error = %e, "failed to persist event, dropping");
            }
        }
        Frame::Registration { device_id: repeated } => {
            if repeated == device_id {
                debug!(device_id, "repeated registration frame ignored");
            } else {
                warn!(
                    device_id,
                    repeated, "registration for a different device on a bound connection, ignoring"
                );
            }
        }
        Frame::Unknown { raw } => {
            MALFORMED_FRAMES.fetch_add(1, Ordering::Relaxed);
            warn!(device_id, raw = %raw, "unparseable frame discarded");
        }
    }
}

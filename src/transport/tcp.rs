//! TCP transport.
//!
//! Each connection gets a reader task and a writer task that move
//! length-prefixed frames between the socket and the pipe channels.

use std::io::ErrorKind;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::codec::{read_frame, write_frame};
use super::{FramePipe, Listener, Transport, TransportError, TransportOptions, PIPE_CAPACITY};
use crate::config::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    max_frame_bytes: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl TcpTransport {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

/// Split a socket into a frame pipe.
fn spawn_pipe(stream: TcpStream, remote: String, max_frame_bytes: usize) -> FramePipe {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (mut reader, mut writer) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel(PIPE_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel(PIPE_CAPACITY);

    let read_remote = remote.clone();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(remote = %read_remote, "Peer closed socket");
                    break;
                }
                Err(e) => {
                    warn!(remote = %read_remote, error = %e, "Dropping connection after read error");
                    break;
                }
            }
        }
    });

    let write_remote = remote.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match write_frame(&mut writer, &frame, max_frame_bytes).await {
                Ok(()) => {}
                Err(e @ TransportError::FrameTooLarge { .. }) => {
                    warn!(
                        remote = %write_remote,
                        kind = frame.kind_name(),
                        error = %e,
                        "Skipping oversized frame"
                    );
                }
                Err(e) => {
                    warn!(remote = %write_remote, error = %e, "Dropping connection after write error");
                    break;
                }
            }
        }
        // Dropping the write half sends FIN.
    });

    FramePipe {
        tx: out_tx,
        rx: in_rx,
        remote,
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, options: &TransportOptions) -> Result<FramePipe, TransportError> {
        let addr = options.addr();
        let stream = TcpStream::connect(&addr).await.map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotFound => {
                TransportError::Unreachable(addr.clone())
            }
            _ => TransportError::Io(e),
        })?;
        Ok(spawn_pipe(stream, addr, self.max_frame_bytes))
    }

    async fn bind(&self, options: &TransportOptions) -> Result<Listener, TransportError> {
        let addr = options.addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => TransportError::AddressInUse(addr.clone()),
            _ => TransportError::Io(e),
        })?;
        let local = listener.local_addr()?;
        info!(addr = %local, "TCP listener bound");

        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        let max_frame_bytes = self.max_frame_bytes;
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let pipe = spawn_pipe(stream, peer.to_string(), max_frame_bytes);
                        if tx.send(pipe).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        });

        Ok(Listener::new(format!("tcp://{}", local), rx, move || {
            accept.abort()
        }))
    }
}

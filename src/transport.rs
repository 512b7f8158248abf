//! Framed TCP transport running on a dedicated I/O thread.
//!
//! Each connection gets its own thread driving a single-threaded tokio
//! runtime. The thread exclusively owns the socket and the receive buffers;
//! other threads talk to it only through [`TransportHandle::send`] and
//! [`TransportHandle::close`], neither of which blocks.

use crate::endpoint::{Emitter, Link, TransportEvent};
use crate::error::{ControlError, Result};
use crate::frame::{encode_frame, FrameDecoder};
use crate::message::Message;
use crate::types::CloseReason;
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

const READ_CHUNK: usize = 16 * 1024;

/// Handle to a running control connection
#[derive(Debug, Clone)]
pub struct TransportHandle {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    exit: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    /// Start the I/O thread and connect to `host:port` from it.
    ///
    /// Connection progress is reported through `events`: `Connected` once the
    /// socket is up, a `Message` per decoded frame, and exactly one `Closed`
    /// as the thread's last action. A failed connect is reported as
    /// `Closed(ConnectFailed)`. A host containing a NUL byte is rejected
    /// before any thread is started.
    pub fn connect(host: &str, port: u16, events: Emitter<TransportEvent>) -> Result<Self> {
        if host.contains('\0') {
            return Err(ControlError::Connect(format!(
                "Invalid host {:?}: contains NUL byte",
                host
            )));
        }
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (exit, exit_rx) = watch::channel(false);
        let host = host.to_string();

        std::thread::Builder::new()
            .name(format!("control-io {}:{}", host, port))
            .spawn(move || io_thread(host, port, queue_rx, exit_rx, events))?;

        Ok(Self {
            queue,
            exit: Arc::new(exit),
        })
    }
}

impl Link for TransportHandle {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        let frame = encode_frame(&payload)?;
        self.queue.send(frame).map_err(|_| ControlError::Closed)
    }

    fn close(&self) {
        self.exit.send_replace(true);
    }
}

fn io_thread(
    host: String,
    port: u16,
    queue: mpsc::UnboundedReceiver<Vec<u8>>,
    exit: watch::Receiver<bool>,
    events: Emitter<TransportEvent>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let reason = match runtime {
        Ok(rt) => rt.block_on(run(&host, port, queue, exit, &events)),
        Err(e) => CloseReason::Io(e.to_string()),
    };
    info!("Control connection to {}:{} closed: {}", host, port, reason);
    events.emit(TransportEvent::Closed(reason));
}

async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ControlError::Connect(format!("{}:{}: {}", host, port, e)))?;
    // Control messages are small; don't let Nagle hold them back
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn run(
    host: &str,
    port: u16,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    mut exit: watch::Receiver<bool>,
    events: &Emitter<TransportEvent>,
) -> CloseReason {
    if *exit.borrow_and_update() {
        return CloseReason::Local;
    }

    let stream = tokio::select! {
        biased;
        _ = exit.changed() => return CloseReason::Local,
        res = connect(host, port) => match res {
            Ok(stream) => stream,
            Err(e) => {
                error!("Control connection error: {}", e);
                return CloseReason::ConnectFailed(e.to_string());
            }
        },
    };
    info!("Connected to {}:{}", host, port);
    events.emit(TransportEvent::Connected);

    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut recv_buf = vec![0u8; READ_CHUNK];
    // Frame being written and how much of it is already out
    let mut pending: Option<(Vec<u8>, usize)> = None;

    loop {
        tokio::select! {
            biased;

            _ = exit.changed() => return CloseReason::Local,

            res = write_pending(&mut writer, &pending), if pending.is_some() => match res {
                Ok(n) => {
                    if let Some((frame, written)) = pending.as_mut() {
                        *written += n;
                        if *written == frame.len() {
                            pending = None;
                        }
                    }
                }
                Err(e) => {
                    error!("Control connection write error: {}", e);
                    return CloseReason::Io(e.to_string());
                }
            },

            frame = queue.recv(), if pending.is_none() => match frame {
                Some(frame) => pending = Some((frame, 0)),
                None => return CloseReason::Local,
            },

            res = reader.read(&mut recv_buf) => match res {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => {
                    if let Err(e) = deliver(&mut decoder, &recv_buf[..n], events) {
                        error!("Control connection protocol error: {}", e);
                        return CloseReason::Protocol(e.to_string());
                    }
                }
                Err(e) => {
                    error!("Control connection read error: {}", e);
                    return CloseReason::Io(e.to_string());
                }
            },
        }
    }
}

async fn write_pending(
    writer: &mut OwnedWriteHalf,
    pending: &Option<(Vec<u8>, usize)>,
) -> std::io::Result<usize> {
    match pending {
        Some((frame, written)) => {
            let n = writer.write(&frame[*written..]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            Ok(n)
        }
        None => std::future::pending().await,
    }
}

/// Deframe `data` and emit every complete message in order
fn deliver(decoder: &mut FrameDecoder, data: &[u8], events: &Emitter<TransportEvent>) -> Result<()> {
    decoder.feed(data, |payload| {
        let msg = Message::decode(payload)?;
        events.emit(TransportEvent::Message(msg));
        Ok(())
    })
}

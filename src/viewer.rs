//! Viewer attach handshake.
//!
//! A viewer connection starts like a control connection, then hands the raw
//! socket over to the display protocol once the server answers
//! `attaching-viewer`. The handshake reads exactly one frame at a time so no
//! display bytes are consumed.

use crate::client::ClientProtocol;
use crate::endpoint::Link;
use crate::error::{ControlError, Result};
use crate::frame::{encode_frame, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::message::Message;
use crate::types::{ConnectionInfo, Event, VmState};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Connect to `info`, authenticate and attach a viewer.
///
/// Returns the socket positioned right after the `attaching-viewer` frame.
/// Fails if authentication fails or the VM is not running.
pub async fn attach_viewer(info: &ConnectionInfo) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((info.address.as_str(), info.port))
        .await
        .map_err(|e| ControlError::Connect(format!("{}: {}", info, e)))?;
    stream.set_nodelay(true)?;
    info!("Connected viewer channel to {}", info);

    let (tx, mut outbox) = mpsc::unbounded_channel();
    let mut handshake = ViewerHandshake::new(Outbox { tx }, &info.token);
    handshake.start()?;

    loop {
        while let Ok(payload) = outbox.try_recv() {
            stream.write_all(&encode_frame(&payload)?).await?;
        }
        if handshake.is_done() {
            info!("Viewer attached to {}", info);
            return Ok(stream);
        }
        let msg = read_message(&mut stream).await?;
        handshake.handle(&msg)?;
    }
}

/// Read exactly one framed message
async fn read_message(stream: &mut TcpStream) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact(stream, &mut header).await?;
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(ControlError::OversizeMessage(length));
    }
    let mut payload = vec![0u8; length];
    read_exact(stream, &mut payload).await?;
    Message::decode(&payload)
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ControlError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Collects outgoing payloads until the handshake loop writes them
struct Outbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Link for Outbox {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.tx.send(payload).map_err(|_| ControlError::Closed)
    }

    // Failure drops the socket
    fn close(&self) {}
}

/// Client side of authenticate, then attach-viewer
struct ViewerHandshake<L: Link> {
    protocol: ClientProtocol<L>,
    token: String,
    done: bool,
}

impl<L: Link> ViewerHandshake<L> {
    fn new(link: L, token: &str) -> Self {
        Self {
            protocol: ClientProtocol::new(link),
            token: token.to_string(),
            done: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        self.protocol.send_authenticate(&self.token)
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn handle(&mut self, msg: &Message) -> Result<()> {
        match self.protocol.dispatch(msg)? {
            Some(Event::AuthOk {
                vm_state: VmState::Running,
                name,
                ..
            }) => {
                debug!("Authenticated to {}, attaching viewer", name);
                self.protocol.send_attach_viewer()
            }
            Some(Event::AuthOk { vm_state, .. }) => Err(ControlError::Connect(format!(
                "Server in unexpected state {}",
                vm_state
            ))),
            Some(Event::AuthFailed { error }) => Err(ControlError::Connect(format!(
                "Authentication failed: {}",
                error
            ))),
            Some(Event::ProtocolError { message }) => Err(ControlError::Protocol(message)),
            Some(Event::AttachingViewer) => {
                self.done = true;
                Ok(())
            }
            Some(other) => {
                warn!("Ignored {:?} during viewer handshake", other);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::RecordingLink;

    fn started() -> (ViewerHandshake<RecordingLink>, RecordingLink) {
        let link = RecordingLink::new();
        let mut handshake = ViewerHandshake::new(link.clone(), "tok");
        handshake.start().unwrap();
        (handshake, link)
    }

    #[test]
    fn running_vm_gets_attached() {
        let (mut hs, link) = started();
        hs.handle(&Message::new("auth-ok").with("state", "running").with("name", "vm1"))
            .unwrap();
        assert_eq!(link.sent_types(), vec!["authenticate", "attach-viewer"]);
        assert!(!hs.is_done());

        // Late lifecycle noise while attaching is swallowed
        hs.handle(&Message::new("vm-stopped")).unwrap();
        hs.handle(&Message::new("attaching-viewer")).unwrap();
        assert!(hs.is_done());
    }

    #[test]
    fn stopped_vm_is_refused() {
        let (mut hs, link) = started();
        let err = hs
            .handle(&Message::new("auth-ok").with("state", "stopped").with("name", "vm1"))
            .unwrap_err();
        assert!(err.to_string().contains("unexpected state stopped"));
        assert_eq!(link.sent_types(), vec!["authenticate"]);
    }

    #[test]
    fn auth_failure_and_peer_error_fail() {
        let (mut hs, _) = started();
        let err = hs
            .handle(&Message::new("auth-failed").with("error", "bad token"))
            .unwrap_err();
        assert!(err.to_string().contains("bad token"));

        let (mut hs, _) = started();
        let err = hs
            .handle(&Message::new("error").with("message", "busy"))
            .unwrap_err();
        assert!(matches!(err, ControlError::Protocol(m) if m == "busy"));
    }

    #[test]
    fn out_of_order_reply_is_a_protocol_error() {
        let (mut hs, _) = started();
        assert!(hs.handle(&Message::new("attaching-viewer")).is_err());
    }
}

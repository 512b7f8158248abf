//! Client side of the control protocol: a strict state machine over the
//! base endpoint.

use crate::endpoint::{Endpoint, Link};
use crate::error::{ControlError, Result};
use crate::message::Message;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::{ConnectionState, Event};

/// Apply one inbound message to `state`.
///
/// Returns the next state and the event to emit, if any. A message that is
/// valid in the protocol but not in `state` is a protocol error.
pub fn transition(
    state: ConnectionState,
    msg: ServerMessage,
) -> Result<(ConnectionState, Option<Event>)> {
    use crate::types::ConnectionState::*;

    let next = match (state, msg) {
        (
            Authenticating,
            ServerMessage::AuthOk {
                vm_state,
                name,
                limit_mouse_rate,
            },
        ) => (
            Running,
            Some(Event::AuthOk {
                vm_state,
                name,
                max_mouse_rate: limit_mouse_rate,
            }),
        ),
        (Authenticating, ServerMessage::AuthFailed { error }) => {
            (Unauthenticated, Some(Event::AuthFailed { error }))
        }
        (AttachingViewer, ServerMessage::AttachingViewer) => {
            (Viewer, Some(Event::AttachingViewer))
        }
        (Running, ServerMessage::StartupProgress { fraction }) => {
            (Running, Some(Event::StartupProgress { fraction }))
        }
        (Running, ServerMessage::StartupRejectedMemory) => {
            (Running, Some(Event::StartupRejectedMemory))
        }
        (Running, ServerMessage::StartupFailed { message }) => {
            (Running, Some(Event::StartupFailed { message }))
        }
        (Running, ServerMessage::VmStarted { check_display }) => {
            (Running, Some(Event::VmStarted { check_display }))
        }
        (Running, ServerMessage::VmStopped) => (Running, Some(Event::VmStopped)),
        (Running, ServerMessage::VmDestroyed) => (Running, Some(Event::VmDestroyed)),
        // The server may stop the VM while the viewer handshake is running
        (AttachingViewer, ServerMessage::VmStopped | ServerMessage::VmDestroyed) => {
            (AttachingViewer, None)
        }
        (Running | AttachingViewer | Viewer, ServerMessage::Pong) => (state, Some(Event::Pong)),
        (state, msg) => {
            return Err(ControlError::Protocol(format!(
                "Received {} in invalid state {:?}",
                msg.mtype(),
                state
            )))
        }
    };
    Ok(next)
}

/// Client protocol endpoint.
///
/// Must be driven from a single thread: both `dispatch` and the `send_*`
/// methods read and update the connection state.
#[derive(Debug)]
pub struct ClientProtocol<L> {
    endpoint: Endpoint<L>,
    state: ConnectionState,
}

impl<L: Link> ClientProtocol<L> {
    pub fn new(link: L) -> Self {
        Self {
            endpoint: Endpoint::new(link),
            state: ConnectionState::Unauthenticated,
        }
    }

    pub fn link(&self) -> &L {
        self.endpoint.link()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle one inbound message, returning the event it produces.
    ///
    /// Types outside the client catalog go to the base endpoint.
    pub fn dispatch(&mut self, msg: &Message) -> Result<Option<Event>> {
        match ServerMessage::parse(msg)? {
            Some(parsed) => {
                let (state, event) = transition(self.state, parsed)?;
                self.state = state;
                Ok(event)
            }
            None => self.endpoint.dispatch(msg).map(Some),
        }
    }

    fn need_send_state(&self, required: ConnectionState, msg: &ClientMessage) -> Result<()> {
        if self.state != required {
            return Err(ControlError::InvalidSendState {
                operation: msg.mtype(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn send(&mut self, required: ConnectionState, next: ConnectionState, msg: ClientMessage) -> Result<()> {
        self.need_send_state(required, &msg)?;
        self.state = next;
        self.endpoint.transmit(&msg.to_message())
    }

    pub fn send_authenticate(&mut self, token: &str) -> Result<()> {
        self.send(
            ConnectionState::Unauthenticated,
            ConnectionState::Authenticating,
            ClientMessage::Authenticate {
                token: token.to_string(),
            },
        )
    }

    pub fn send_attach_viewer(&mut self) -> Result<()> {
        self.send(
            ConnectionState::Running,
            ConnectionState::AttachingViewer,
            ClientMessage::AttachViewer,
        )
    }

    pub fn send_start_vm(&mut self) -> Result<()> {
        self.send(ConnectionState::Running, ConnectionState::Running, ClientMessage::StartVm)
    }

    pub fn send_stop_vm(&mut self) -> Result<()> {
        self.send(ConnectionState::Running, ConnectionState::Running, ClientMessage::StopVm)
    }

    pub fn send_destroy_vm(&mut self) -> Result<()> {
        self.send(ConnectionState::Running, ConnectionState::Running, ClientMessage::DestroyVm)
    }

    pub fn send_ping(&mut self) -> Result<()> {
        self.send(ConnectionState::Running, ConnectionState::Running, ClientMessage::Ping)
    }
}

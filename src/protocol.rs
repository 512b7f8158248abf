//! Control protocol message catalog

use crate::error::Result;
use crate::message::Message;
use crate::types::VmState;

/// Message sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Present the access token
    Authenticate { token: String },

    /// Turn this connection into a viewer connection
    AttachViewer,

    StartVm,

    StopVm,

    DestroyVm,

    /// Liveness check
    Ping,
}

impl ClientMessage {
    /// Wire type tag
    pub fn mtype(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::AttachViewer => "attach-viewer",
            ClientMessage::StartVm => "start-vm",
            ClientMessage::StopVm => "stop-vm",
            ClientMessage::DestroyVm => "destroy-vm",
            ClientMessage::Ping => "ping",
        }
    }

    pub fn to_message(&self) -> Message {
        let msg = Message::new(self.mtype());
        match self {
            ClientMessage::Authenticate { token } => msg.with("token", token.as_str()),
            _ => msg,
        }
    }
}

/// Message sent from server to client, minus the base `error` message
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthOk {
        vm_state: VmState,
        name: String,
        limit_mouse_rate: i64,
    },
    AuthFailed {
        error: String,
    },
    AttachingViewer,
    StartupProgress {
        fraction: f64,
    },
    StartupRejectedMemory,
    StartupFailed {
        message: String,
    },
    VmStarted {
        check_display: bool,
    },
    VmStopped,
    VmDestroyed,
    Pong,
}

impl ServerMessage {
    /// Parse a decoded message.
    ///
    /// Returns `Ok(None)` for types this catalog does not define, so the
    /// caller can hand them to the base endpoint.
    pub fn parse(msg: &Message) -> Result<Option<Self>> {
        let parsed = match msg.mtype() {
            "auth-ok" => ServerMessage::AuthOk {
                vm_state: msg.get_vm_state("state")?,
                name: msg.get_string("name")?,
                limit_mouse_rate: msg.get_int_or("limit_mouse_rate", 0)?,
            },
            "auth-failed" => ServerMessage::AuthFailed {
                error: msg.get_string("error")?,
            },
            "attaching-viewer" => ServerMessage::AttachingViewer,
            "startup-progress" => ServerMessage::StartupProgress {
                fraction: msg.get_double("fraction")?,
            },
            "startup-rejected-memory" => ServerMessage::StartupRejectedMemory,
            "startup-failed" => ServerMessage::StartupFailed {
                message: msg.get_string("message")?,
            },
            "vm-started" => ServerMessage::VmStarted {
                check_display: msg.get_bool("check_display")?,
            },
            "vm-stopped" => ServerMessage::VmStopped,
            "vm-destroyed" => ServerMessage::VmDestroyed,
            "pong" => ServerMessage::Pong,
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// Wire type tag
    pub fn mtype(&self) -> &'static str {
        match self {
            ServerMessage::AuthOk { .. } => "auth-ok",
            ServerMessage::AuthFailed { .. } => "auth-failed",
            ServerMessage::AttachingViewer => "attaching-viewer",
            ServerMessage::StartupProgress { .. } => "startup-progress",
            ServerMessage::StartupRejectedMemory => "startup-rejected-memory",
            ServerMessage::StartupFailed { .. } => "startup-failed",
            ServerMessage::VmStarted { .. } => "vm-started",
            ServerMessage::VmStopped => "vm-stopped",
            ServerMessage::VmDestroyed => "vm-destroyed",
            ServerMessage::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_tags_match_catalog() {
        let tags: Vec<&str> = [
            ClientMessage::Authenticate { token: "t".into() },
            ClientMessage::AttachViewer,
            ClientMessage::StartVm,
            ClientMessage::StopVm,
            ClientMessage::DestroyVm,
            ClientMessage::Ping,
        ]
        .iter()
        .map(|m| m.mtype())
        .collect();
        assert_eq!(
            tags,
            vec!["authenticate", "attach-viewer", "start-vm", "stop-vm", "destroy-vm", "ping"]
        );
    }

    #[test]
    fn authenticate_carries_token() {
        let msg = ClientMessage::Authenticate { token: "abc".into() }.to_message();
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.mtype(), "authenticate");
        assert_eq!(decoded.get_string("token").unwrap(), "abc");
    }

    #[test]
    fn parses_auth_ok_with_default_mouse_rate() {
        let msg = Message::new("auth-ok")
            .with("state", "stopped")
            .with("name", "vm1");
        assert_eq!(
            ServerMessage::parse(&msg).unwrap(),
            Some(ServerMessage::AuthOk {
                vm_state: VmState::Stopped,
                name: "vm1".into(),
                limit_mouse_rate: 0,
            })
        );

        let msg = msg.with("limit_mouse_rate", 20i64).with("state", "hibernating");
        assert_eq!(
            ServerMessage::parse(&msg).unwrap(),
            Some(ServerMessage::AuthOk {
                vm_state: VmState::Unknown,
                name: "vm1".into(),
                limit_mouse_rate: 20,
            })
        );
    }

    #[test]
    fn required_fields_are_enforced() {
        assert!(ServerMessage::parse(&Message::new("auth-ok").with("state", "running")).is_err());
        assert!(ServerMessage::parse(&Message::new("auth-failed")).is_err());
        assert!(ServerMessage::parse(&Message::new("startup-progress")).is_err());
        assert!(ServerMessage::parse(&Message::new("startup-failed")).is_err());
        assert!(ServerMessage::parse(&Message::new("vm-started")).is_err());
    }

    #[test]
    fn unknown_and_base_types_are_left_to_the_endpoint() {
        assert_eq!(ServerMessage::parse(&Message::new("frobnicate")).unwrap(), None);
        assert_eq!(
            ServerMessage::parse(&Message::new("error").with("message", "x")).unwrap(),
            None
        );
    }
}

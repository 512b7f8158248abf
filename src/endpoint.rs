//! Protocol endpoint: the base layer shared by every protocol flavour.
//!
//! An [`Endpoint`] turns outgoing messages into payloads for a [`Link`] and
//! handles the untyped part of the protocol (`error` and unknown types).
//! [`Emitter`] and [`EventReceiver`] are the one-way, non-blocking channel
//! that carries results from the I/O thread to the consumer context.

use crate::error::{ControlError, Result};
use crate::message::Message;
use crate::types::{CloseReason, Event};
use log::debug;
use tokio::sync::mpsc;

/// Outbound side of a connection.
///
/// Both methods must be callable from any thread and must not block.
pub trait Link {
    /// Queue one encoded message for transmission
    fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Request the connection to close. Idempotent.
    fn close(&self);
}

/// What the transport reports to the consumer context
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// A decoded inbound message, in arrival order
    Message(Message),
    /// Last event of every connection, sent exactly once
    Closed(CloseReason),
}

/// Producer half of an event channel
#[derive(Debug)]
pub struct Emitter<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: std::fmt::Debug> Emitter<T> {
    /// Hand `event` to the consumer without blocking
    pub fn emit(&self, event: T) {
        if let Err(e) = self.tx.send(event) {
            debug!("Event consumer gone, dropping {:?}", e.0);
        }
    }
}

/// Consumer half of an event channel
#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventReceiver<T> {
    /// Wait for the next event; `None` once every emitter is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Create an unbounded event channel
pub fn channel<T>() -> (Emitter<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Emitter { tx }, EventReceiver { rx })
}

/// Base protocol endpoint over a link
#[derive(Debug)]
pub struct Endpoint<L> {
    link: L,
}

impl<L: Link> Endpoint<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Encode `msg` and hand it to the link
    pub fn transmit(&self, msg: &Message) -> Result<()> {
        debug!("Sending message: {}", msg.mtype());
        self.link.send(msg.encode()?)
    }

    /// Handle the message types every protocol understands.
    ///
    /// A peer `error` becomes [`Event::ProtocolError`]; any other type is
    /// unknown and fails.
    pub fn dispatch(&self, msg: &Message) -> Result<Event> {
        match msg.mtype() {
            "error" => Ok(Event::ProtocolError {
                message: msg.get_string("message")?,
            }),
            other => Err(ControlError::Protocol(format!(
                "Received unknown message of type {}",
                other
            ))),
        }
    }
}

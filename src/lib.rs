//! vmlink - client for a VM server's control channel
//!
//! This library speaks the length-prefixed MessagePack control protocol used
//! to authenticate to a VM server, drive the VM lifecycle and attach viewers.
//!
//! # Example - Control Session
//!
//! ```rust,no_run
//! use vmlink::{ConnectionInfo, KeepaliveConfig, Session, VmState};
//!
//! #[tokio::main]
//! async fn main() -> vmlink::Result<()> {
//!     let info = ConnectionInfo::new("vm.example.org", 0, "secret-token");
//!     let mut session = Session::connect(&info, KeepaliveConfig::default())?;
//!     let mut events = session.subscribe();
//!
//!     // Applied as soon as the session is authenticated
//!     session.want_vm_state(VmState::Running);
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let reason = session.run().await;
//!     println!("Session ended: {}", reason);
//!     Ok(())
//! }
//! ```
//!
//! # Example - Viewer
//!
//! ```rust,no_run
//! use vmlink::{attach_viewer, ConnectionInfo};
//!
//! #[tokio::main]
//! async fn main() -> vmlink::Result<()> {
//!     let info = ConnectionInfo::new("vm.example.org", 0, "secret-token");
//!
//!     // The stream now carries the display protocol
//!     let stream = attach_viewer(&info).await?;
//!     println!("Viewer attached from {}", stream.local_addr()?);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod message;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;
pub mod viewer;

// Re-export commonly used types
pub use client::ClientProtocol;
pub use config::{ControlConfig, KeepaliveConfig};
pub use endpoint::{Emitter, EventReceiver, Link, TransportEvent};
pub use error::{ControlError, Result};
pub use message::Message;
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{Session, SessionCommand, SessionHandle};
pub use transport::TransportHandle;
pub use types::{CloseReason, ConnectionInfo, ConnectionState, Event, VmState, DEFAULT_PORT};
pub use viewer::attach_viewer;

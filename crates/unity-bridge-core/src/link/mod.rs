//! Editor link: the TCP channel between the bridge and the editor plugin.
//!
//! - [`protocol`]: length-prefixed JSON frames and message types
//! - [`server`]: listener, handshake and promotion
//! - `connection`: per-socket reader, writer, heartbeat and teardown
//! - [`dispatch`]: admission queue consumer feeding the active connection

pub(crate) mod connection;
pub mod dispatch;
pub mod protocol;
pub mod server;

pub use dispatch::{DispatchTicket, OutboundRequest};
pub use protocol::{BridgeMessage, EditorErrorBody, EditorMessage};
pub use server::{EditorLinkHandle, EditorLinkServer};

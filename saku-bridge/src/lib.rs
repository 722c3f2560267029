//! Bridge between the Saku browser shell and an embedded Neovim process.
//!
//! The editor runs as a child process speaking a framed RPC protocol over
//! its stdin/stdout. This crate owns that link end to end: process spawn
//! and framing ([`transport`]), request/response correlation and dispatch
//! ([`session`]), the screen-update stream ([`redraw`]), the plugin
//! extension surface ([`plugin`]), and the connection lifecycle
//! ([`lifecycle`]). Everything above it — windows, HTML components, menus —
//! is shell glue that calls in through [`EditorBridge`].

pub mod error;
pub mod lifecycle;
pub mod plugin;
pub mod protocol;
pub mod redraw;
pub mod session;
pub mod transport;

pub use error::{BridgeError, RpcError};
pub use lifecycle::{EditorBridge, LifecycleState, StartOptions};
pub use plugin::ApiRegistry;
pub use protocol::RpcMessage;
pub use redraw::{RedrawBatch, RedrawOp, RedrawSink};
pub use session::Session;
pub use transport::{EditorProcess, Transport, TransportEvent};

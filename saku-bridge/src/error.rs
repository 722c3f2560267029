use std::io;

use thiserror::Error;

/// An explicit error frame returned by the editor for one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Everything that can go wrong between the shell and the embedded editor.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The editor executable could not be launched. Fatal to `start()`.
    #[error("failed to spawn editor process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The transport ended. Every pending call is resolved with this.
    #[error("connection to the editor process is closed")]
    ConnectionClosed,

    /// The remote answered a call with an error frame. Other pending
    /// calls are unaffected.
    #[error("editor returned an error: {0}")]
    Rpc(#[from] RpcError),

    /// A single malformed frame. The frame is discarded and logged; the
    /// connection stays up unless framing itself becomes unrecoverable.
    #[error("malformed protocol frame: {0}")]
    Decode(String),

    /// An operation was issued in a lifecycle state that does not allow it.
    #[error("invalid lifecycle state: {0}")]
    InvalidState(&'static str),
}

impl BridgeError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

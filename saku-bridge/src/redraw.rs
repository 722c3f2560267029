//! Decoder for the editor's batched "redraw" notification.
//!
//! Each notification argument is one sub-command `[opname, ...opargs]`.
//! The decoder checks that shape and nothing else: unknown opnames are
//! forwarded untouched so newer editors keep working against older stores,
//! and the whole batch reaches the store as a single update.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Session;

/// One screen sub-operation, e.g. `["put", ["a"]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedrawOp {
    pub name: String,
    pub args: Vec<Value>,
}

/// The ordered op sequence of one "redraw" notification.
///
/// Serializable so shells can ship whole batches to a UI store living in
/// another context (e.g. a webview) without re-encoding op by op.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RedrawBatch {
    pub ops: Vec<RedrawOp>,
}

/// Receives decoded batches. Implemented by the UI state store.
///
/// `apply` is invoked once per notification, never once per op, so
/// observers of the store never see a partially-applied frame.
pub trait RedrawSink: Send + Sync {
    fn apply(&self, batch: RedrawBatch);
}

/// Decode one notification's argument list into an ordered batch.
///
/// Sub-commands that are not `[string, ...]` arrays are logged and skipped;
/// everything else passes through verbatim.
pub fn decode_batch(args: Vec<Value>) -> RedrawBatch {
    let mut ops = Vec::with_capacity(args.len());
    for entry in args {
        let Some(items) = entry.as_array() else {
            log::warn!("redraw sub-command is not an array: {}", entry);
            continue;
        };
        let Some(name) = items.first().and_then(Value::as_str) else {
            log::warn!("redraw sub-command has no opname: {}", entry);
            continue;
        };
        ops.push(RedrawOp {
            name: name.to_string(),
            args: items[1..].to_vec(),
        });
    }
    RedrawBatch { ops }
}

/// Route the session's "redraw" notifications into `sink`, one `apply` per
/// notification.
pub fn subscribe_redraw(session: &Session, sink: Arc<dyn RedrawSink>) {
    session.subscribe("redraw", move |_, args| {
        sink.apply(decode_batch(args));
    });
}

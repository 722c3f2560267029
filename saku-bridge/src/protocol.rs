//! Wire codec for the editor RPC link.
//!
//! A frame is a 4-byte little-endian payload length followed by a JSON
//! array whose first element is an integer type tag:
//!
//! - request:      `[0, msgid, method, args]`
//! - response:     `[1, msgid, error, result]` (`error` is null on success)
//! - notification: `[2, method, args]`
//!
//! Error payloads are `[code, message]` arrays.

use serde_json::{json, Value};

use crate::error::{BridgeError, RpcError};

pub const TAG_REQUEST: u64 = 0;
pub const TAG_RESPONSE: u64 = 1;
pub const TAG_NOTIFICATION: u64 = 2;

/// Upper bound on a single frame payload (32 MiB).
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// One discrete unit on the RPC wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        msgid: u64,
        method: String,
        args: Vec<Value>,
    },
    Response {
        msgid: u64,
        error: Option<Value>,
        result: Value,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
}

/// Encode a message into a complete frame (length prefix included).
pub fn encode(msg: &RpcMessage) -> Result<Vec<u8>, BridgeError> {
    let payload = match msg {
        RpcMessage::Request {
            msgid,
            method,
            args,
        } => json!([TAG_REQUEST, msgid, method, args]),
        RpcMessage::Response {
            msgid,
            error,
            result,
        } => json!([TAG_RESPONSE, msgid, error, result]),
        RpcMessage::Notification { method, args } => {
            json!([TAG_NOTIFICATION, method, args])
        }
    };
    let body = serde_json::to_vec(&payload).map_err(|e| BridgeError::decode(e.to_string()))?;
    // The same cap as inbound frames; it also keeps the u32 length prefix
    // from ever truncating.
    if body.len() > MAX_FRAME_LEN {
        return Err(BridgeError::Decode(format!(
            "outgoing frame payload too large ({} bytes)",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame payload (the bytes after the length prefix).
pub fn decode(body: &[u8]) -> Result<RpcMessage, BridgeError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| BridgeError::decode(e.to_string()))?;
    let items = value
        .as_array()
        .ok_or_else(|| BridgeError::decode("frame payload is not an array"))?;
    let tag = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::decode("frame has no integer type tag"))?;

    match tag {
        TAG_REQUEST => {
            if items.len() != 4 {
                return Err(BridgeError::decode("request frame must have 4 elements"));
            }
            Ok(RpcMessage::Request {
                msgid: take_msgid(&items[1])?,
                method: take_method(&items[2])?,
                args: take_args(&items[3])?,
            })
        }
        TAG_RESPONSE => {
            if items.len() != 4 {
                return Err(BridgeError::decode("response frame must have 4 elements"));
            }
            let error = match &items[2] {
                Value::Null => None,
                other => Some(other.clone()),
            };
            Ok(RpcMessage::Response {
                msgid: take_msgid(&items[1])?,
                error,
                result: items[3].clone(),
            })
        }
        TAG_NOTIFICATION => {
            if items.len() != 3 {
                return Err(BridgeError::decode(
                    "notification frame must have 3 elements",
                ));
            }
            Ok(RpcMessage::Notification {
                method: take_method(&items[1])?,
                args: take_args(&items[2])?,
            })
        }
        other => Err(BridgeError::Decode(format!("unknown frame tag {}", other))),
    }
}

/// Interpret the `error` slot of a response frame.
///
/// Well-formed errors are `[code, message]`; anything else is preserved as
/// the message text with code 0 so the caller still sees what the remote
/// sent.
pub fn error_from_value(value: &Value) -> RpcError {
    if let Some(items) = value.as_array() {
        if items.len() == 2 {
            if let (Some(code), Some(message)) = (items[0].as_i64(), items[1].as_str()) {
                return RpcError::new(code, message);
            }
        }
    }
    RpcError::new(0, value.to_string())
}

fn take_msgid(value: &Value) -> Result<u64, BridgeError> {
    value
        .as_u64()
        .ok_or_else(|| BridgeError::decode("msgid is not an unsigned integer"))
}

fn take_method(value: &Value) -> Result<String, BridgeError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BridgeError::decode("method name is not a string"))
}

fn take_args(value: &Value) -> Result<Vec<Value>, BridgeError> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| BridgeError::decode("argument list is not an array"))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: RpcMessage) {
        let frame = encode(&msg).unwrap();
        let (len_buf, body) = frame.split_at(4);
        let len = u32::from_le_bytes(len_buf.try_into().unwrap()) as usize;
        assert_eq!(len, body.len());
        assert_eq!(decode(body).unwrap(), msg);
    }

    #[test]
    fn request_round_trip() {
        round_trip(RpcMessage::Request {
            msgid: 7,
            method: "nvim_command".to_string(),
            args: vec![json!("edit! /tmp/foo")],
        });
    }

    #[test]
    fn response_round_trip() {
        round_trip(RpcMessage::Response {
            msgid: 7,
            error: None,
            result: json!(["a", "b"]),
        });
        round_trip(RpcMessage::Response {
            msgid: 8,
            error: Some(json!([1, "boom"])),
            result: Value::Null,
        });
    }

    #[test]
    fn notification_round_trip() {
        round_trip(RpcMessage::Notification {
            method: "redraw".to_string(),
            args: vec![json!(["put", ["a"]])],
        });
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let msg = RpcMessage::Notification {
            method: "saku:blob".to_string(),
            args: vec![json!("x".repeat(MAX_FRAME_LEN))],
        };
        assert!(matches!(encode(&msg), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn rejects_non_array_payload() {
        assert!(matches!(
            decode(b"{\"not\":\"a frame\"}"),
            Err(BridgeError::Decode(_))
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(decode(b"[9,1,\"m\",[]]"), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(matches!(decode(b"[0,1,\"m\"]"), Err(BridgeError::Decode(_))));
        assert!(matches!(decode(b"[2,\"m\"]"), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn rejects_bad_field_types() {
        assert!(matches!(
            decode(b"[0,\"id\",\"m\",[]]"),
            Err(BridgeError::Decode(_))
        ));
        assert!(matches!(decode(b"[2,3,[]]"), Err(BridgeError::Decode(_))));
        assert!(matches!(
            decode(b"[2,\"m\",\"args\"]"),
            Err(BridgeError::Decode(_))
        ));
    }

    #[test]
    fn error_value_pair_is_parsed() {
        let err = error_from_value(&json!([5, "invalid expression"]));
        assert_eq!(err, RpcError::new(5, "invalid expression"));
    }

    #[test]
    fn error_value_fallback_keeps_payload_text() {
        let err = error_from_value(&json!("plain message"));
        assert_eq!(err.code, 0);
        assert!(err.message.contains("plain message"));
    }
}

//! Request/response correlation and inbound dispatch on top of the
//! transport.
//!
//! One dispatch task per session consumes transport events in wire order,
//! so handlers always observe frames in the order the editor sent them.
//! Receipt is buffered on an unbounded channel; a slow handler delays
//! dispatch of later frames but never their receipt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, RpcError};
use crate::protocol::{self, RpcMessage};
use crate::transport::{Transport, TransportEvent};

/// Error code sent back when the remote calls a method nobody handles.
const METHOD_NOT_FOUND: i64 = -32601;

/// Handler for inbound requests. Must produce exactly one result; an `Err`
/// becomes an error response frame.
pub type RequestHandler =
    Arc<dyn Fn(&str, Vec<Value>) -> Result<Value, RpcError> + Send + Sync>;

/// Handler for one subscribed notification name.
pub type NotificationHandler = Arc<dyn Fn(&str, Vec<Value>) + Send + Sync>;

/// Invoked once when the transport disconnects.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

type PendingCalls = Mutex<HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>>;

struct SessionInner {
    transport: Transport,
    next_msgid: AtomicU64,
    pending: PendingCalls,
    request_handler: Mutex<Option<RequestHandler>>,
    notification_handlers: Mutex<HashMap<String, NotificationHandler>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    closed: AtomicBool,
}

/// One logical RPC link to the embedded editor. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Build a session over an attached transport and start its dispatch
    /// task.
    pub fn new(transport: Transport, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                transport,
                next_msgid: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                request_handler: Mutex::new(None),
                notification_handlers: Mutex::new(HashMap::new()),
                disconnect_handlers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        tokio::spawn(dispatch_task(session.inner.clone(), events));
        session
    }

    /// Send a request and suspend until the matching response arrives or the
    /// connection closes. Responses are matched strictly by id, so calls may
    /// overlap and resolve out of order.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ConnectionClosed);
        }

        let msgid = self.inner.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(msgid, tx);

        let sent = self.inner.transport.send(RpcMessage::Request {
            msgid,
            method: method.to_string(),
            args,
        });
        if let Err(err) = sent {
            self.inner.pending.lock().remove(&msgid);
            return Err(err);
        }

        rx.await.map_err(|_| BridgeError::ConnectionClosed)?
    }

    /// Fire-and-forget send; no correlation id, no waiting.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), BridgeError> {
        self.inner.transport.send(RpcMessage::Notification {
            method: method.to_string(),
            args,
        })
    }

    /// Install the handler for inbound requests. Last registration wins.
    pub fn set_request_handler(
        &self,
        handler: impl Fn(&str, Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    ) {
        *self.inner.request_handler.lock() = Some(Arc::new(handler));
    }

    /// Route an inbound notification name to a handler. Registering the same
    /// name twice replaces the previous handler.
    pub fn subscribe(
        &self,
        name: &str,
        handler: impl Fn(&str, Vec<Value>) + Send + Sync + 'static,
    ) {
        self.inner
            .notification_handlers
            .lock()
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Drop the handler for a notification name. Unknown names are a no-op.
    pub fn unsubscribe(&self, name: &str) {
        self.inner.notification_handlers.lock().remove(name);
    }

    /// Register a callback fired once when the transport disconnects.
    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.disconnect_handlers.lock().push(Box::new(handler));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn dispatch_task(
    inner: Arc<SessionInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let event = match events.recv().await {
            Some(event) => event,
            // Transport tasks are gone without an explicit disconnect
            // event; treat it the same way.
            None => break,
        };

        match event {
            TransportEvent::Frame(RpcMessage::Response {
                msgid,
                error,
                result,
            }) => {
                let slot = inner.pending.lock().remove(&msgid);
                match slot {
                    Some(tx) => {
                        let outcome = match error {
                            Some(err) => Err(BridgeError::Rpc(protocol::error_from_value(&err))),
                            None => Ok(result),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => log::warn!("response for unknown msgid {}", msgid),
                }
            }
            TransportEvent::Frame(RpcMessage::Request {
                msgid,
                method,
                args,
            }) => {
                let handler = inner.request_handler.lock().clone();
                let outcome = match handler {
                    Some(handler) => handler(&method, args),
                    None => Err(RpcError::new(
                        METHOD_NOT_FOUND,
                        format!("no handler for method '{}'", method),
                    )),
                };
                let response = match outcome {
                    Ok(result) => RpcMessage::Response {
                        msgid,
                        error: None,
                        result,
                    },
                    Err(err) => RpcMessage::Response {
                        msgid,
                        error: Some(serde_json::json!([err.code, err.message])),
                        result: Value::Null,
                    },
                };
                if inner.transport.send(response).is_err() {
                    log::warn!("connection closed before response to '{}' was sent", method);
                }
            }
            TransportEvent::Frame(RpcMessage::Notification { method, args }) => {
                let handler = inner.notification_handlers.lock().get(&method).cloned();
                match handler {
                    Some(handler) => handler(&method, args),
                    None => log::debug!("unhandled notification '{}'", method),
                }
            }
            TransportEvent::Disconnected => break,
        }
    }

    inner.closed.store(true, Ordering::Release);

    // Resolve every outstanding call so no caller hangs.
    let drained: Vec<_> = {
        let mut pending = inner.pending.lock();
        pending.drain().collect()
    };
    if !drained.is_empty() {
        log::warn!(
            "connection closed with {} pending call(s) outstanding",
            drained.len()
        );
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(BridgeError::ConnectionClosed));
    }

    let handlers = std::mem::take(&mut *inner.disconnect_handlers.lock());
    for handler in &handlers {
        handler();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::io::{ReadHalf, WriteHalf};

    use super::*;
    use crate::protocol::wire;

    type Remote = (
        ReadHalf<tokio::io::DuplexStream>,
        WriteHalf<tokio::io::DuplexStream>,
    );

    fn connected_session() -> (Session, Remote) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let (transport, events) = Transport::attach(reader, writer);
        let session = Session::new(transport, events);
        let (remote_reader, remote_writer) = tokio::io::split(remote);
        (session, (remote_reader, remote_writer))
    }

    #[tokio::test]
    async fn echoed_response_resolves_call_with_args() {
        let (session, (mut reader, mut writer)) = connected_session();

        let remote = tokio::spawn(async move {
            if let Some(RpcMessage::Request { msgid, args, .. }) =
                wire::read_frame(&mut reader).await
            {
                wire::write_frame(
                    &mut writer,
                    &RpcMessage::Response {
                        msgid,
                        error: None,
                        result: json!(args),
                    },
                )
                .await;
            }
        });

        let result = session
            .call("nvim_echo", vec![json!("hello"), json!(2)])
            .await
            .unwrap();
        assert_eq!(result, json!([json!("hello"), json!(2)]));
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_responses_match_by_id() {
        let (session, (mut reader, mut writer)) = connected_session();

        let remote = tokio::spawn(async move {
            let first = wire::read_frame(&mut reader).await.unwrap();
            let second = wire::read_frame(&mut reader).await.unwrap();
            // Answer the second request first.
            for msg in [second, first] {
                if let RpcMessage::Request { msgid, method, .. } = msg {
                    wire::write_frame(
                        &mut writer,
                        &RpcMessage::Response {
                            msgid,
                            error: None,
                            result: json!(method),
                        },
                    )
                    .await;
                }
            }
        });

        let a = session.call("alpha", vec![]);
        let b = session.call("beta", vec![]);
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), json!("alpha"));
        assert_eq!(b.unwrap(), json!("beta"));
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_frame_surfaces_as_rpc_error() {
        let (session, (mut reader, mut writer)) = connected_session();

        tokio::spawn(async move {
            if let Some(RpcMessage::Request { msgid, .. }) = wire::read_frame(&mut reader).await {
                wire::write_frame(
                    &mut writer,
                    &RpcMessage::Response {
                        msgid,
                        error: Some(json!([1, "Vim:E492: Not an editor command"])),
                        result: Value::Null,
                    },
                )
                .await;
            }
        });

        match session.call("nvim_command", vec![json!("bogus")]).await {
            Err(BridgeError::Rpc(err)) => {
                assert_eq!(err.code, 1);
                assert!(err.message.contains("E492"));
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_resolves_every_outstanding_call() {
        let (session, (mut reader, writer)) = connected_session();

        let remote = tokio::spawn(async move {
            // Absorb the three requests, then hang up without answering.
            for _ in 0..3 {
                wire::read_frame(&mut reader).await.unwrap();
            }
            drop(writer);
            drop(reader);
        });

        let calls = tokio::join!(
            session.call("one", vec![]),
            session.call("two", vec![]),
            session.call("three", vec![]),
        );
        remote.await.unwrap();
        for outcome in [calls.0, calls.1, calls.2] {
            assert!(matches!(outcome, Err(BridgeError::ConnectionClosed)));
        }
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn call_after_close_fails_immediately() {
        let (session, (reader, writer)) = connected_session();
        drop(reader);
        drop(writer);

        // Wait for the disconnect to propagate.
        while !session.is_closed() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            session.call("late", vec![]).await,
            Err(BridgeError::ConnectionClosed)
        ));
        assert!(matches!(
            session.notify("late", vec![]),
            Err(BridgeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn inbound_request_gets_exactly_one_response() {
        let (session, (mut reader, mut writer)) = connected_session();

        session.set_request_handler(|method, args| match method {
            "shell:ping" => Ok(json!(args)),
            _ => Err(RpcError::new(METHOD_NOT_FOUND, "nope")),
        });

        wire::write_frame(
            &mut writer,
            &RpcMessage::Request {
                msgid: 42,
                method: "shell:ping".to_string(),
                args: vec![json!(7)],
            },
        )
        .await;

        match wire::read_frame(&mut reader).await.unwrap() {
            RpcMessage::Response {
                msgid,
                error,
                result,
            } => {
                assert_eq!(msgid, 42);
                assert!(error.is_none());
                assert_eq!(result, json!([7]));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failing_request_handler_becomes_error_response() {
        let (session, (mut reader, mut writer)) = connected_session();

        session.set_request_handler(|_, _| Err(RpcError::new(13, "handler refused")));

        wire::write_frame(
            &mut writer,
            &RpcMessage::Request {
                msgid: 9,
                method: "shell:fail".to_string(),
                args: vec![],
            },
        )
        .await;

        match wire::read_frame(&mut reader).await.unwrap() {
            RpcMessage::Response { msgid, error, .. } => {
                assert_eq!(msgid, 9);
                assert_eq!(error, Some(json!([13, "handler refused"])));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unhandled_request_gets_method_not_found() {
        let (_session, (mut reader, mut writer)) = connected_session();

        wire::write_frame(
            &mut writer,
            &RpcMessage::Request {
                msgid: 1,
                method: "shell:unknown".to_string(),
                args: vec![],
            },
        )
        .await;

        match wire::read_frame(&mut reader).await.unwrap() {
            RpcMessage::Response { msgid, error, .. } => {
                assert_eq!(msgid, 1);
                let err = error.unwrap();
                assert_eq!(err[0], json!(METHOD_NOT_FOUND));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn notifications_dispatch_in_wire_order_and_unknown_names_are_dropped() {
        let (session, (_reader, mut writer)) = connected_session();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            session.subscribe("shell:log", move |_, args| {
                seen.lock().push(args);
            });
        }
        {
            let count = count.clone();
            session.subscribe("shell:tick", move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        for (method, arg) in [
            ("shell:log", json!(1)),
            ("shell:nobody-home", json!(0)),
            ("shell:log", json!(2)),
            ("shell:tick", json!(0)),
        ] {
            wire::write_frame(
                &mut writer,
                &RpcMessage::Notification {
                    method: method.to_string(),
                    args: vec![arg],
                },
            )
            .await;
        }

        // The tick arrives last, so once it lands the log order is settled.
        while count.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(&*seen.lock(), &[vec![json!(1)], vec![json!(2)]]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_dispatch() {
        let (session, (_reader, mut writer)) = connected_session();

        let hits = Arc::new(AtomicUsize::new(0));
        let marks = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            session.subscribe("plugin:event", move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let marks = marks.clone();
            session.subscribe("plugin:mark", move |_, _| {
                marks.fetch_add(1, Ordering::SeqCst);
            });
        }

        session.unsubscribe("plugin:event");

        for method in ["plugin:event", "plugin:mark"] {
            wire::write_frame(
                &mut writer,
                &RpcMessage::Notification {
                    method: method.to_string(),
                    args: vec![],
                },
            )
            .await;
        }

        while marks.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}

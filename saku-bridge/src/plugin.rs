//! Extension surface: named notification handlers registered by
//! collaborators (HTML component loaders, recent-document glue, ...)
//! without coupling them to the transport.
//!
//! The remote invokes a binding by sending an ordinary notification frame
//! whose method is the registered name, conventionally under a reserved
//! prefix such as `saku:`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::session::Session;

/// Handler for one plugin API name. The returned value is currently only
/// meaningful to the handler's own caller; notifications discard it.
pub type ApiHandler = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

struct RegistryInner {
    bindings: Mutex<HashMap<String, ApiHandler>>,
    attached: Mutex<Option<Session>>,
}

/// Name-to-handler registry with a subscribe/unsubscribe lifecycle tied to
/// session attach/detach. Cheap to clone.
#[derive(Clone)]
pub struct ApiRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                bindings: Mutex::new(HashMap::new()),
                attached: Mutex::new(None),
            }),
        }
    }

    /// Add or replace a binding. Last registration under a name wins; there
    /// is deliberately no duplicate detection.
    pub fn register(
        &self,
        name: &str,
        handler: impl Fn(Vec<Value>) -> Value + Send + Sync + 'static,
    ) {
        self.inner
            .bindings
            .lock()
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Invoke the handler bound to `name`. Unregistered names are a no-op
    /// yielding null, never an error.
    pub fn dispatch(&self, name: &str, args: Vec<Value>) -> Value {
        let handler = self.inner.bindings.lock().get(name).cloned();
        match handler {
            Some(handler) => handler(args),
            None => {
                log::debug!("plugin api '{}' is not registered", name);
                Value::Null
            }
        }
    }

    /// Route every current binding's name through this registry on the given
    /// session, and announce each subscription to the remote so broadcast
    /// notifications reach us.
    pub fn attach(&self, session: &Session) {
        let names = self.names();
        for name in &names {
            let registry = self.clone();
            session.subscribe(name, move |method, args| {
                registry.dispatch(method, args);
            });
            if let Err(err) = session.notify("nvim_subscribe", vec![Value::String(name.clone())]) {
                log::warn!("could not subscribe '{}' on the editor: {}", name, err);
            }
        }
        *self.inner.attached.lock() = Some(session.clone());
        log::info!("plugin api attached with {} binding(s)", names.len());
    }

    /// Remove this registry's subscriptions from whatever session it was
    /// last attached to. Safe to call when not attached.
    pub fn detach(&self) {
        let Some(session) = self.inner.attached.lock().take() else {
            return;
        };
        for name in self.names() {
            session.unsubscribe(&name);
            let _ = session.notify("nvim_unsubscribe", vec![Value::String(name)]);
        }
    }

    fn names(&self) -> Vec<String> {
        self.inner.bindings.lock().keys().cloned().collect()
    }
}

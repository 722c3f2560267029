//! Connection lifecycle: spawn the editor, run the attach handshake, track
//! attached/detached state, and route disconnection to collaborators.
//!
//! States move `Idle -> Starting -> Attached -> Detached`; a detached bridge
//! never reconnects by itself, a new `start()` is required.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{BridgeError, RpcError};
use crate::plugin::ApiRegistry;
use crate::redraw::{self, RedrawSink};
use crate::session::Session;
use crate::transport::{EditorProcess, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Attached,
    Detached,
}

/// How to launch and attach the embedded editor.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Editor executable, resolved through PATH.
    pub command: String,
    /// Caller-supplied arguments, passed through before the embed flags.
    pub args: Vec<String>,
    /// Initial UI geometry announced during the handshake.
    pub columns: u64,
    pub rows: u64,
    /// Optional runtime directory appended to the editor's runtimepath,
    /// with `plugin/saku.vim` sourced from it after attach.
    pub runtime_dir: Option<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            command: "nvim".to_string(),
            args: Vec::new(),
            columns: 80,
            rows: 24,
            runtime_dir: None,
        }
    }
}

type DetachHandler = Arc<dyn Fn() + Send + Sync>;
type StoredRequestHandler =
    Arc<dyn Fn(&str, Vec<Value>) -> Result<Value, RpcError> + Send + Sync>;

struct BridgeInner {
    state: Mutex<LifecycleState>,
    session: Mutex<Option<Session>>,
    process: Mutex<Option<EditorProcess>>,
    registry: ApiRegistry,
    redraw_sink: Mutex<Option<Arc<dyn RedrawSink>>>,
    request_handler: Mutex<Option<StoredRequestHandler>>,
    detach_handlers: Mutex<Vec<DetachHandler>>,
}

/// The single logical connection to one embedded editor process.
///
/// Owns the process handle, the session, and the plugin registry; all
/// collaborator access goes through these methods. Cheap to clone.
#[derive(Clone)]
pub struct EditorBridge {
    inner: Arc<BridgeInner>,
}

impl Default for EditorBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorBridge {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                state: Mutex::new(LifecycleState::Idle),
                session: Mutex::new(None),
                process: Mutex::new(None),
                registry: ApiRegistry::new(),
                redraw_sink: Mutex::new(None),
                request_handler: Mutex::new(None),
                detach_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// The plugin API registry attached on handshake and detached on
    /// disconnect. Register bindings before `start()`.
    pub fn registry(&self) -> &ApiRegistry {
        &self.inner.registry
    }

    /// Install the UI state store fed by "redraw" notifications. Takes
    /// effect at the next `start()`.
    pub fn set_redraw_sink(&self, sink: Arc<dyn RedrawSink>) {
        *self.inner.redraw_sink.lock() = Some(sink);
    }

    /// Install the handler for requests the editor makes of the shell.
    pub fn set_request_handler(
        &self,
        handler: impl Fn(&str, Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    ) {
        let handler: StoredRequestHandler = Arc::new(handler);
        if let Some(session) = self.inner.session.lock().clone() {
            let installed = handler.clone();
            session.set_request_handler(move |method, args| installed(method, args));
        }
        *self.inner.request_handler.lock() = Some(handler);
    }

    /// Register a callback fired whenever the connection is lost.
    pub fn on_detach(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.detach_handlers.lock().push(Arc::new(handler));
    }

    /// Spawn the editor and run the attach handshake.
    ///
    /// The child is launched as
    /// `<command> <args...> --cmd 'let g:saku_version="…"' -n --embed`:
    /// swap files are disabled because their prompts would stall an embedded
    /// instance, and the version variable lets runtime plugins detect the
    /// shell.
    pub async fn start(&self, opts: StartOptions) -> Result<(), BridgeError> {
        self.begin()?;

        let argv = build_argv(&opts);
        let (process, stdin, stdout) = match EditorProcess::spawn(&opts.command, &argv) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.teardown(false);
                return Err(err);
            }
        };
        log::info!(
            "editor process '{}' spawned (pid {:?})",
            opts.command,
            process.id()
        );
        *self.inner.process.lock() = Some(process);

        let (transport, events) = Transport::attach(stdout, stdin);
        self.connect(transport, events, &opts).await
    }

    /// Explicitly close the connection by killing the child; the resulting
    /// stream close drives the normal disconnect path.
    pub fn stop(&self) {
        if let Some(process) = self.inner.process.lock().as_mut() {
            if let Err(err) = process.start_kill() {
                log::warn!("could not kill editor process: {}", err);
            }
        }
    }

    /// Send a request to the editor and await its response.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.active_session()?.call(method, args).await
    }

    /// Fire-and-forget notification to the editor.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), BridgeError> {
        self.active_session()?.notify(method, args)
    }

    /// Execute one ex command in the editor.
    pub async fn send_command(&self, text: &str) -> Result<(), BridgeError> {
        self.call("nvim_command", vec![json!(text)]).await?;
        Ok(())
    }

    /// The editor's runtimepath entries, used by collaborators to discover
    /// plugin-provided UI components.
    pub async fn list_runtime_paths(&self) -> Result<Vec<String>, BridgeError> {
        let result = self.call("nvim_list_runtime_paths", vec![]).await?;
        let paths = result
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(paths)
    }

    /// Re-announce UI geometry, e.g. after a window resize.
    pub async fn attach_ui(&self, columns: u64, rows: u64) -> Result<(), BridgeError> {
        let session = self.active_session()?;
        attach_ui(&session, columns, rows).await
    }

    fn active_session(&self) -> Result<Session, BridgeError> {
        self.inner
            .session
            .lock()
            .clone()
            .ok_or(BridgeError::ConnectionClosed)
    }

    /// `Idle`/`Detached` -> `Starting`. One connection per bridge instance.
    fn begin(&self) -> Result<(), BridgeError> {
        let mut state = self.inner.state.lock();
        match *state {
            LifecycleState::Idle | LifecycleState::Detached => {
                *state = LifecycleState::Starting;
                Ok(())
            }
            LifecycleState::Starting | LifecycleState::Attached => {
                Err(BridgeError::InvalidState("editor is already running"))
            }
        }
    }

    /// Attach a session over an established transport and run the handshake.
    async fn connect(
        &self,
        transport: Transport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        opts: &StartOptions,
    ) -> Result<(), BridgeError> {
        let session = Session::new(transport, events);

        let bridge = self.clone();
        session.on_disconnect(move || bridge.teardown(true));

        if let Some(handler) = self.inner.request_handler.lock().clone() {
            session.set_request_handler(move |method, args| handler(method, args));
        }
        if let Some(sink) = self.inner.redraw_sink.lock().clone() {
            redraw::subscribe_redraw(&session, sink);
        }
        *self.inner.session.lock() = Some(session.clone());

        if let Err(err) = attach_ui(&session, opts.columns, opts.rows).await {
            log::warn!("attach handshake failed: {}", err);
            // The error return is the report to the collaborator; detach
            // callbacks stay quiet for a connection that never attached.
            self.teardown(false);
            return Err(err);
        }

        if let Some(dir) = &opts.runtime_dir {
            let escaped = dir.replace(' ', "\\ ");
            let bootstrap = session.notify(
                "nvim_command",
                vec![json!(format!(
                    "set rtp+={} | runtime plugin/saku.vim",
                    escaped
                ))],
            );
            if let Err(err) = bootstrap {
                self.teardown(false);
                return Err(err);
            }
        }

        self.inner.registry.attach(&session);

        {
            let mut state = self.inner.state.lock();
            // The transport can drop in the window between the handshake
            // response and this point; teardown already ran then.
            if *state == LifecycleState::Detached {
                return Err(BridgeError::ConnectionClosed);
            }
            *state = LifecycleState::Attached;
        }
        log::info!("editor attached ({}x{})", opts.columns, opts.rows);
        Ok(())
    }

    /// Idempotent transition to `Detached`.
    fn teardown(&self, notify_collaborators: bool) {
        {
            let mut state = self.inner.state.lock();
            if *state == LifecycleState::Detached {
                return;
            }
            *state = LifecycleState::Detached;
        }

        self.inner.registry.detach();
        self.inner.session.lock().take();
        if let Some(mut process) = self.inner.process.lock().take() {
            let _ = process.start_kill();
            // Reap the exit status so the child never lingers as a zombie.
            tokio::spawn(async move {
                let _ = process.wait().await;
            });
        }

        if notify_collaborators {
            log::info!("editor detached");
            let handlers: Vec<DetachHandler> =
                self.inner.detach_handlers.lock().iter().cloned().collect();
            for handler in handlers {
                handler();
            }
        }
    }
}

async fn attach_ui(session: &Session, columns: u64, rows: u64) -> Result<(), BridgeError> {
    session
        .call(
            "nvim_ui_attach",
            vec![json!(columns), json!(rows), json!({ "rgb": true })],
        )
        .await?;
    Ok(())
}

fn build_argv(opts: &StartOptions) -> Vec<String> {
    let mut argv = opts.args.clone();
    argv.push("--cmd".to_string());
    argv.push(format!(
        "let g:saku_version=\"{}\"",
        env!("CARGO_PKG_VERSION")
    ));
    argv.push("-n".to_string());
    argv.push("--embed".to_string());
    argv
}

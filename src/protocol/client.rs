//! Persistent channel to the semantic engine.
//!
//! One reader task per attached engine process matches responses to the
//! pending table by id and forwards notifications to a separate dispatch
//! task, so a slow handler never stalls response matching. Writers share a
//! mutex held only for the duration of one frame, so requests pipeline.
//!
//! Ordinary requests wait (bounded by the startup timeout) until the
//! initialize handshake of the current engine process has completed.

use log::{debug, error, info, trace, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, watch};

use super::framing::{read_frame, write_frame};
use super::lsp::{initialize_params, negotiated_encoding, Incoming};
use crate::error::{AnalysisError, Result};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// No engine attached, or the attached one went away. Requests wait.
    Detached,
    Handshaking,
    Ready,
    /// The engine is gone for good. Requests fail fast.
    Unavailable,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub root: PathBuf,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
}

/// Background indexing progress reported through `$/progress`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexingStatus {
    pub active: bool,
    pub title: Option<String>,
    pub message: Option<String>,
    pub percentage: Option<u64>,
    pub completed_runs: u64,
}

#[derive(Debug, Default)]
struct SessionInfo {
    capabilities: Value,
    position_encoding: String,
    handshakes: u64,
}

struct Pending {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

struct Shared {
    options: ClientOptions,
    next_id: AtomicU64,
    /// Bumped on every attach/close; stale reader tasks compare and bail.
    generation: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    state: watch::Sender<ChannelState>,
    handlers: RwLock<HashMap<String, Vec<NotificationHandler>>>,
    notifications: mpsc::UnboundedSender<(String, Value)>,
    session: Mutex<SessionInfo>,
    indexing: Arc<watch::Sender<IndexingStatus>>,
}

#[derive(Clone)]
pub struct ProtocolClient {
    shared: Arc<Shared>,
}

impl ProtocolClient {
    /// Create a detached client. Must be called inside a tokio runtime.
    pub fn new(options: ClientOptions) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Detached);
        let shared = Arc::new(Shared {
            options,
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(None),
            state,
            handlers: RwLock::new(HashMap::new()),
            notifications: notify_tx,
            session: Mutex::new(SessionInfo::default()),
            indexing: Arc::new(watch::channel(IndexingStatus::default()).0),
        });
        tokio::spawn(dispatch_notifications(Arc::downgrade(&shared), notify_rx));

        let client = Self { shared };
        client.register_builtin_handlers();
        client
    }

    fn register_builtin_handlers(&self) {
        self.on_notification("window/logMessage", |params| {
            let message = params.get("message").and_then(|m| m.as_str()).unwrap_or("");
            match params.get("type").and_then(|t| t.as_u64()).unwrap_or(4) {
                1 => error!("clangd: {message}"),
                2 => warn!("clangd: {message}"),
                3 => info!("clangd: {message}"),
                _ => debug!("clangd: {message}"),
            }
        });
        self.on_notification("textDocument/publishDiagnostics", |params| {
            let count = params
                .get("diagnostics")
                .and_then(|d| d.as_array())
                .map(Vec::len)
                .unwrap_or(0);
            debug!(
                "{count} diagnostics for {}",
                params.get("uri").and_then(|u| u.as_str()).unwrap_or("?")
            );
        });
        self.on_notification("textDocument/clangd.fileStatus", |params| {
            trace!("file status: {params}");
        });

        let indexing = self.shared.indexing.clone();
        self.on_notification("$/progress", move |params| {
            let Some(value) = params.get("value") else { return };
            indexing.send_if_modified(|status| match value.get("kind").and_then(|k| k.as_str()) {
                Some("begin") => {
                    status.active = true;
                    status.title = value.get("title").and_then(|t| t.as_str()).map(str::to_string);
                    status.message = None;
                    status.percentage = value.get("percentage").and_then(|p| p.as_u64());
                    info!(
                        "engine progress started: {}",
                        status.title.as_deref().unwrap_or("indexing")
                    );
                    true
                }
                Some("report") => {
                    if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
                        status.message = Some(message.to_string());
                    }
                    if let Some(pct) = value.get("percentage").and_then(|p| p.as_u64()) {
                        status.percentage = Some(pct);
                    }
                    true
                }
                Some("end") => {
                    status.active = false;
                    status.percentage = Some(100);
                    status.completed_runs += 1;
                    info!("engine progress finished");
                    true
                }
                _ => false,
            });
        });
    }

    /// Register a handler for an engine notification. Handlers run on the
    /// dispatch task and must not block.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.handlers.write() {
            handlers
                .entry(method.to_string())
                .or_default()
                .push(Arc::new(handler));
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn indexing(&self) -> IndexingStatus {
        self.shared.indexing.borrow().clone()
    }

    /// Wait for the next background indexing run to finish. Returns false
    /// when `timeout` passes first.
    pub async fn wait_for_indexing(&self, timeout: Duration) -> bool {
        let mut status = self.shared.indexing.subscribe();
        let baseline = status.borrow_and_update().completed_runs;
        info!("waiting up to {}s for background indexing", timeout.as_secs());
        let finished = tokio::time::timeout(
            timeout,
            status.wait_for(|s| s.completed_runs > baseline),
        )
        .await;
        match finished {
            Ok(Ok(_)) => {
                info!("background indexing finished");
                true
            }
            _ => {
                warn!(
                    "indexing did not finish within {}s; continuing with a partial index",
                    timeout.as_secs()
                );
                false
            }
        }
    }

    pub fn capabilities(&self) -> Value {
        self.shared
            .session
            .lock()
            .map(|s| s.capabilities.clone())
            .unwrap_or(Value::Null)
    }

    pub fn position_encoding(&self) -> String {
        self.shared
            .session
            .lock()
            .map(|s| s.position_encoding.clone())
            .unwrap_or_default()
    }

    /// Number of completed handshakes, one per attached engine process.
    pub fn handshakes(&self) -> u64 {
        self.shared.session.lock().map(|s| s.handshakes).unwrap_or(0)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn request_timeout(&self) -> Duration {
        self.shared.options.request_timeout
    }

    /// Bind the client to a (new) engine process and run the handshake.
    ///
    /// Requests left over from a previous process fail with a crash error.
    pub async fn attach<R, W>(&self, reader: R, writer: W) -> Result<Value>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .fail_pending(|| AnalysisError::Crash("engine channel replaced".into()));
        *self.shared.writer.lock().await = Some(Box::new(writer));
        self.shared.set_state(ChannelState::Handshaking);
        tokio::spawn(read_loop(
            Arc::downgrade(&self.shared),
            BufReader::new(reader),
            generation,
        ));

        let params = initialize_params(&self.shared.options.root);
        let init = match self
            .call("initialize", params, self.shared.options.startup_timeout)
            .await
        {
            Ok(init) => init,
            Err(err) => {
                warn!("engine handshake failed: {err}");
                self.shared.set_state(ChannelState::Detached);
                return Err(err);
            }
        };
        self.send_notification("initialized", json!({})).await?;

        let encoding = negotiated_encoding(&init);
        if encoding != "utf-8" {
            warn!("engine uses {encoding} positions; columns past non-ASCII text may be shifted");
        }
        if let Ok(mut session) = self.shared.session.lock() {
            session.capabilities = init.get("capabilities").cloned().unwrap_or(Value::Null);
            session.position_encoding = encoding;
            session.handshakes += 1;
        }
        if self.shared.generation.load(Ordering::SeqCst) == generation {
            self.shared.set_state(ChannelState::Ready);
            info!("engine handshake complete");
        }
        Ok(init)
    }

    /// Send a request with the default timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, self.shared.options.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.wait_ready().await?;
        self.call(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.wait_ready().await?;
        self.send_notification(method, params).await
    }

    /// The engine process went away; requests wait for the next attach.
    pub fn detach(&self, reason: &str) {
        self.shared.channel_lost(reason);
    }

    /// The engine will not come back. Pending and future requests fail fast.
    pub fn mark_unavailable(&self, reason: &str) {
        self.shared.set_state(ChannelState::Unavailable);
        let reason = reason.to_string();
        self.shared
            .fail_pending(|| AnalysisError::ServiceUnavailable(reason.clone()));
    }

    /// Orderly `shutdown`/`exit` exchange, then close the channel.
    pub async fn shutdown(&self) {
        if self.state() == ChannelState::Ready {
            match self.call("shutdown", Value::Null, SHUTDOWN_TIMEOUT).await {
                Ok(_) => {
                    if let Err(err) = self.send_notification("exit", Value::Null).await {
                        debug!("exit notification not delivered: {err}");
                    }
                }
                Err(err) => debug!("engine shutdown request failed: {err}"),
            }
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.set_state(ChannelState::Closed);
        self.shared
            .fail_pending(|| AnalysisError::ServiceUnavailable("client closed".into()));
        *self.shared.writer.lock().await = None;
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let startup = self.shared.options.startup_timeout;
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ChannelState::Ready => return Ok(()),
                    ChannelState::Unavailable => {
                        return Err(AnalysisError::ServiceUnavailable(
                            "engine is degraded".into(),
                        ))
                    }
                    ChannelState::Closed => {
                        return Err(AnalysisError::ServiceUnavailable("client closed".into()))
                    }
                    ChannelState::Detached | ChannelState::Handshaking => {}
                }
                if rx.changed().await.is_err() {
                    return Err(AnalysisError::ServiceUnavailable("client dropped".into()));
                }
            }
        };
        match tokio::time::timeout(startup, wait).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::ServiceUnavailable(format!(
                "engine not ready within {}s",
                startup.as_secs_f32()
            ))),
        }
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .map_err(|_| AnalysisError::Protocol("pending request table poisoned".into()))?
            .insert(
                id,
                Pending {
                    method: method.to_string(),
                    reply: tx,
                },
            );

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.shared.write_message(&message).await {
            self.shared.remove_pending(id);
            return Err(AnalysisError::Crash(format!("write to engine failed: {err}")));
        }
        trace!("-> {method} #{id}");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AnalysisError::Crash(format!(
                "channel closed before {method} was answered"
            ))),
            Err(_) => {
                self.shared.remove_pending(id);
                debug!("{method} #{id} timed out after {timeout:?}");
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    let cancel = json!({
                        "jsonrpc": "2.0",
                        "method": "$/cancelRequest",
                        "params": { "id": id },
                    });
                    let _ = shared.write_message(&cancel).await;
                });
                Err(AnalysisError::timeout(method, timeout))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.shared
            .write_message(&message)
            .await
            .map_err(|err| AnalysisError::Crash(format!("write to engine failed: {err}")))
    }
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            // terminal states stick
            if *current == state
                || *current == ChannelState::Closed
                || (*current == ChannelState::Unavailable && state != ChannelState::Closed)
            {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn write_message(&self, message: &Value) -> io::Result<()> {
        let body = serde_json::to_vec(message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no engine attached"))?;
        write_frame(writer, &body).await
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    fn complete(&self, id: u64, outcome: Result<Value>) {
        let entry = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        match entry {
            Some(pending) => {
                trace!("<- {} #{id}", pending.method);
                let _ = pending.reply.send(outcome);
            }
            None => debug!("response #{id} arrived after its caller gave up"),
        }
    }

    fn fail_pending(&self, err: impl Fn() -> AnalysisError) {
        let drained: Vec<Pending> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, p)| p).collect(),
            Err(_) => return,
        };
        for pending in drained {
            let _ = pending.reply.send(Err(err()));
        }
    }

    fn channel_lost(&self, reason: &str) {
        warn!("engine channel lost: {reason}");
        self.set_state(ChannelState::Detached);
        self.fail_pending(|| AnalysisError::Crash(reason.to_string()));
    }
}

async fn read_loop<R>(shared: Weak<Shared>, mut reader: R, generation: u64)
where
    R: AsyncBufRead + Unpin,
{
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "engine closed its output".to_string(),
            Err(err) => break format!("engine stream error: {err}"),
        };
        let Some(shared) = shared.upgrade() else { return };
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let message: Value = match serde_json::from_slice(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping malformed engine message: {err}");
                continue;
            }
        };
        match Incoming::classify(message) {
            Some(Incoming::Response { id, outcome }) => shared.complete(id, outcome),
            Some(Incoming::Notification { method, params }) => {
                let _ = shared.notifications.send((method, params));
            }
            Some(Incoming::Request { id, method }) => {
                debug!("answering engine request {method}");
                tokio::spawn(async move {
                    let reply = json!({ "jsonrpc": "2.0", "id": id, "result": null });
                    if let Err(err) = shared.write_message(&reply).await {
                        debug!("reply to {method} failed: {err}");
                    }
                });
            }
            None => debug!("ignoring engine message without id or method"),
        }
    };

    if let Some(shared) = shared.upgrade() {
        if shared.generation.load(Ordering::SeqCst) == generation {
            shared.channel_lost(&reason);
        }
    }
}

async fn dispatch_notifications(
    shared: Weak<Shared>,
    mut rx: mpsc::UnboundedReceiver<(String, Value)>,
) {
    while let Some((method, params)) = rx.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        let handlers = shared
            .handlers
            .read()
            .map(|h| h.get(&method).cloned().unwrap_or_default())
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!("unhandled notification {method}");
        }
        for handler in handlers {
            handler(&params);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::{split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    pub(crate) fn options(root: &Path) -> ClientOptions {
        ClientOptions {
            root: root.to_path_buf(),
            request_timeout: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(2),
        }
    }

    pub(crate) struct Server {
        pub reader: BufReader<ReadHalf<DuplexStream>>,
        pub writer: WriteHalf<DuplexStream>,
    }

    impl Server {
        pub async fn next(&mut self) -> Option<Value> {
            let frame = read_frame(&mut self.reader).await.ok()??;
            serde_json::from_slice(&frame).ok()
        }

        pub async fn send(&mut self, message: Value) {
            let body = serde_json::to_vec(&message).unwrap();
            write_frame(&mut self.writer, &body).await.unwrap();
        }

        pub async fn reply(&mut self, id: &Value, result: Value) {
            self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                .await;
        }

        /// Answer `initialize`, swallow `initialized`.
        pub async fn handshake(&mut self) {
            let init = self.next().await.unwrap();
            assert_eq!(init["method"], "initialize");
            self.reply(
                &init["id"],
                json!({ "capabilities": { "hoverProvider": true }, "offsetEncoding": "utf-8" }),
            )
            .await;
            let initialized = self.next().await.unwrap();
            assert_eq!(initialized["method"], "initialized");
        }
    }

    /// Attach `client` to an in-memory engine without running the handshake.
    pub(crate) fn pipe() -> (
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
        Server,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = split(client_io);
        let (server_read, server_write) = split(server_io);
        (
            client_read,
            client_write,
            Server {
                reader: BufReader::new(server_read),
                writer: server_write,
            },
        )
    }

    async fn ready_client() -> (ProtocolClient, Server) {
        let client = ProtocolClient::new(options(Path::new("/p")));
        let (r, w, mut server) = pipe();
        let attach = {
            let client = client.clone();
            tokio::spawn(async move { client.attach(r, w).await })
        };
        server.handshake().await;
        attach.await.unwrap().unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn requests_issued_before_handshake_are_flushed_after_it() {
        let client = ProtocolClient::new(options(Path::new("/p")));
        let early = {
            let client = client.clone();
            tokio::spawn(async move { client.request("textDocument/hover", json!({"n": 1})).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state(), ChannelState::Detached);

        let (r, w, mut server) = pipe();
        let attach = {
            let client = client.clone();
            tokio::spawn(async move { client.attach(r, w).await })
        };
        server.handshake().await;
        let hover = server.next().await.unwrap();
        assert_eq!(hover["method"], "textDocument/hover");
        server.reply(&hover["id"], json!({"contents": "int"})).await;

        attach.await.unwrap().unwrap();
        let result = early.await.unwrap().unwrap();
        assert_eq!(result["contents"], "int");
        assert_eq!(client.position_encoding(), "utf-8");
        assert_eq!(client.handshakes(), 1);
    }

    #[tokio::test]
    async fn pipelined_responses_match_by_id() {
        let (client, mut server) = ready_client().await;
        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.request("a", json!({"tag": "first"})).await })
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.request("b", json!({"tag": "second"})).await })
        };

        let m1 = server.next().await.unwrap();
        let m2 = server.next().await.unwrap();
        // answer in reverse order
        server.reply(&m2["id"], m2["params"]["tag"].clone()).await;
        server.reply(&m1["id"], m1["params"]["tag"].clone()).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn timeout_cancels_only_that_request() {
        let (client, mut server) = ready_client().await;
        let err = client
            .request_with_timeout("slow", Value::Null, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_len(), 0);

        let slow = server.next().await.unwrap();
        assert_eq!(slow["method"], "slow");
        let cancel = server.next().await.unwrap();
        assert_eq!(cancel["method"], "$/cancelRequest");
        // a late answer is dropped quietly
        server.reply(&slow["id"], json!(1)).await;

        let fast = {
            let client = client.clone();
            tokio::spawn(async move { client.request("fast", Value::Null).await })
        };
        let msg = server.next().await.unwrap();
        server.reply(&msg["id"], json!("ok")).await;
        assert_eq!(fast.await.unwrap().unwrap(), json!("ok"));
        assert_eq!(client.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn poisoned_pending_table_fails_the_request_at_once() {
        let (client, _server) = ready_client().await;
        let shared = client.shared.clone();
        std::thread::spawn(move || {
            let _held = shared.pending.lock().unwrap();
            panic!("writer died holding the pending table");
        })
        .join()
        .unwrap_err();

        let err = tokio::time::timeout(
            Duration::from_millis(500),
            client.request("textDocument/hover", Value::Null),
        )
        .await
        .expect("request should not wait for a reply")
        .unwrap_err();
        assert!(matches!(err, AnalysisError::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn notifications_reach_handlers_and_engine_requests_get_answers() {
        let (client, mut server) = ready_client().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_notification("custom/ping", move |params| {
            let _ = tx.send(params.clone());
        });

        server
            .send(json!({"jsonrpc": "2.0", "id": 99, "method": "window/workDoneProgress/create", "params": {"token": "t"}}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "method": "$/progress", "params": {"token": "t", "value": {"kind": "begin", "title": "indexing"}}}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "method": "custom/ping", "params": {"n": 3}}))
            .await;

        let reply = server.next().await.unwrap();
        assert_eq!(reply["id"], 99);
        assert!(reply["result"].is_null());

        let params = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params["n"], 3);
        let status = client.indexing();
        assert!(status.active);
        assert_eq!(status.title.as_deref(), Some("indexing"));
    }

    #[tokio::test]
    async fn waiting_for_indexing_ends_with_the_next_progress_end() {
        let (client, mut server) = ready_client().await;
        assert!(!client.wait_for_indexing(Duration::from_millis(50)).await);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_for_indexing(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        for kind in ["begin", "report", "end"] {
            server
                .send(json!({"jsonrpc": "2.0", "method": "$/progress", "params": {"token": "idx", "value": {"kind": kind, "title": "indexing", "percentage": 50}}}))
                .await;
        }
        assert!(waiter.await.unwrap());
        let status = client.indexing();
        assert!(!status.active);
        assert_eq!(status.completed_runs, 1);
        assert_eq!(status.percentage, Some(100));
    }

    #[tokio::test]
    async fn engine_exit_fails_in_flight_requests() {
        let (client, mut server) = ready_client().await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("textDocument/definition", Value::Null).await })
        };
        let _ = server.next().await.unwrap();
        server.writer.shutdown().await.unwrap();
        drop(server);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "crash_error");
        assert_eq!(client.state(), ChannelState::Detached);
    }

    #[tokio::test]
    async fn unavailable_engine_fails_fast() {
        let (client, _server) = ready_client().await;
        client.mark_unavailable("restart limit reached");
        let started = std::time::Instant::now();
        let err = client.request("textDocument/hover", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn requests_give_up_when_engine_never_attaches() {
        let mut opts = options(Path::new("/p"));
        opts.startup_timeout = Duration::from_millis(50);
        let client = ProtocolClient::new(opts);
        let err = client.request("textDocument/hover", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "service_unavailable");
    }
}

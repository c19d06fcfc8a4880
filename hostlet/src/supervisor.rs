//! Process supervisor: owns the transport server for one run, injects the
//! bootstrap environment, tracks connected agents and routes control traffic.
//!
//! Flow:
//! 1. `prepare` allocates a run id, binds the socket, writes the descriptor
//! 2. `activate` exports the bootstrap environment around the actual launch
//! 3. agents connect back; each gets its own channel endpoint
//! 4. requests issued through the supervisor are routed back to the owning
//!    connection, never broadcast (multiple agents overlap during hand-off)
//! 5. `close` drains writers, removes socket and descriptor files

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{ClientId, ControlMessage, MessageKind, RequestId, commands};
use crate::bridge::transport::ChannelListener;
use crate::channel::{Channel, ChannelError, ChannelFailure, HandlerRejection, spawn_writer};
use crate::context::HostContext;
use crate::descriptor::{RUN_ID_ENV, RUNTIME_DIR_ENV, RunDescriptor, RunId};
use crate::proxy::{FetchRequest, NullResolver, ProxyError, ProxyFetcher, SiblingResolver};

/// Invoked when a connection is detected as corrupted. The default logs the
/// failure and exits the process with the failure's code: a control channel
/// that cannot be parsed cannot be trusted to carry a clean shutdown.
pub type FatalHook = Arc<dyn Fn(i32, &str) + Send + Sync>;

fn default_fatal_hook() -> FatalHook {
    Arc::new(|code, detail| {
        tracing::error!(exit_code = code, %detail, "Control channel corrupted, exiting");
        std::process::exit(code);
    })
}

/// Supervisor-side observations a lifecycle manager reacts to.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    /// Agent reported the hosted app's bound URL.
    UrlReported { client: ClientId, url: String },
    /// Agent reported an uncaught error; the child is exiting.
    ChildFatal { client: ClientId, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to bind control socket: {0}")]
    Bind(std::io::Error),
    #[error("failed to write run descriptor: {0}")]
    Descriptor(std::io::Error),
    #[error("supervisor already closed")]
    Closed,
    #[error("no connected client {0}")]
    UnknownClient(ClientId),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Configuration for one supervised run.
pub struct SupervisorConfig {
    pub context_data: serde_json::Map<String, serde_json::Value>,
    pub loader: Option<String>,
    pub scripts: Vec<String>,
    pub resolver: Arc<dyn SiblingResolver>,
    pub fatal_hook: FatalHook,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            context_data: serde_json::Map::new(),
            loader: None,
            scripts: Vec::new(),
            resolver: Arc::new(NullResolver),
            fatal_hook: default_fatal_hook(),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context_data(
        mut self,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.context_data = data;
        self
    }

    pub fn with_loader(mut self, loader: impl Into<String>) -> Self {
        self.loader = Some(loader.into());
        self
    }

    pub fn with_scripts(mut self, scripts: Vec<String>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SiblingResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }
}

struct ClientConnection {
    channel: Arc<Channel>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

/// State shared with connection tasks; holds no task handles so tasks can
/// keep a strong reference without forming a cycle.
struct Shared {
    clients: DashMap<ClientId, ClientConnection>,
    request_owners: DashMap<RequestId, ClientId>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    url_tx: watch::Sender<Option<String>>,
    fatal_hook: FatalHook,
    proxy: ProxyFetcher,
}

impl Shared {
    /// Tear down one connection: fail its pending requests, forget its
    /// request ownerships, tell subscribers.
    fn disconnect(&self, client_id: ClientId) {
        if let Some((_, conn)) = self.clients.remove(&client_id) {
            conn.channel.close();
            conn.reader.abort();
            self.request_owners.retain(|_, owner| *owner != client_id);
            tracing::info!(client = %client_id, "Agent disconnected");
            let _ = self
                .events_tx
                .send(SupervisorEvent::ClientDisconnected(client_id));
        }
    }
}

/// Subscription to supervisor events.
pub struct SupervisorEvents {
    rx: broadcast::Receiver<SupervisorEvent>,
}

impl SupervisorEvents {
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Supervisor event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// RAII scope around a child launch: exports the bootstrap environment and
/// restores the previous values on drop, even when the launch fails.
pub struct ActivationGuard {
    saved: Vec<(String, Option<String>)>,
}

impl ActivationGuard {
    fn set(vars: &[(String, String)]) -> Self {
        let mut saved = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            saved.push((key.clone(), std::env::var(key).ok()));
            // SAFETY: activation scopes are held across a single-threaded
            // launch window; nothing else mutates the environment meanwhile.
            unsafe { std::env::set_var(key, value) };
        }
        Self { saved }
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..) {
            // SAFETY: same scope as `set`.
            unsafe {
                match previous {
                    Some(value) => std::env::set_var(&key, value),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

pub struct ProcessSupervisor {
    run: RunDescriptor,
    shared: Arc<Shared>,
    accept_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProcessSupervisor {
    /// Allocate a run id, bind the transport server and write the descriptor.
    pub fn prepare(
        ctx: &HostContext,
        config: SupervisorConfig,
    ) -> Result<Arc<Self>, SupervisorError> {
        let run_id = RunId::generate();
        let runtime_dir = &ctx.config.runtime_dir;
        std::fs::create_dir_all(runtime_dir).map_err(SupervisorError::Descriptor)?;

        let run = RunDescriptor::new(
            run_id,
            runtime_dir,
            config.context_data,
            config.loader,
            config.scripts,
        );

        let listener = ChannelListener::bind(run.socket_path()).map_err(SupervisorError::Bind)?;
        run.write().map_err(SupervisorError::Descriptor)?;

        let (events_tx, _) = broadcast::channel(64);
        let (url_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            clients: DashMap::new(),
            request_owners: DashMap::new(),
            events_tx,
            url_tx,
            fatal_hook: config.fatal_hook,
            proxy: ProxyFetcher::new(config.resolver),
        });

        tracing::info!(run_id = %run.id(), socket = %run.socket_path().display(), "Supervisor prepared");

        let accept_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok(stream) => add_client(&shared, stream),
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed, stopping listener");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Arc::new(Self {
            run,
            shared,
            accept_task: StdMutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn descriptor(&self) -> &RunDescriptor {
        &self.run
    }

    pub fn run_id(&self) -> &RunId {
        self.run.id()
    }

    /// Environment the child must inherit to find the descriptor.
    pub fn env_for_child(&self) -> Vec<(String, String)> {
        vec![
            (RUN_ID_ENV.to_string(), self.run.id().to_string()),
            (
                RUNTIME_DIR_ENV.to_string(),
                self.run.runtime_dir().display().to_string(),
            ),
        ]
    }

    /// Export the bootstrap environment for the duration of a launch.
    ///
    /// The returned guard restores prior values on drop, so a failed launch
    /// cannot pollute concurrent or subsequent activations.
    pub fn activate(&self) -> ActivationGuard {
        ActivationGuard::set(&self.env_for_child())
    }

    pub fn subscribe(&self) -> SupervisorEvents {
        SupervisorEvents {
            rx: self.shared.events_tx.subscribe(),
        }
    }

    /// Most recently reported URL across connected agents.
    pub fn latest_url(&self) -> Option<String> {
        self.shared.url_tx.borrow().clone()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.shared.clients.iter().map(|e| *e.key()).collect()
    }

    /// Issue a request to one connected agent and await its response.
    ///
    /// The request id is recorded as owned by that connection; a response
    /// arriving on any other connection is dropped.
    pub async fn request(
        &self,
        client_id: ClientId,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        let (req_id, rx) = {
            let conn = self
                .shared
                .clients
                .get(&client_id)
                .ok_or(SupervisorError::UnknownClient(client_id))?;
            conn.channel.begin_request(command, payload)?
        };
        self.shared.request_owners.insert(req_id, client_id);

        let result = match rx.await {
            Ok(result) => result.map_err(SupervisorError::Channel),
            Err(_) => Err(SupervisorError::Channel(ChannelError::Closed)),
        };
        self.shared.request_owners.remove(&req_id);
        result
    }

    /// One-way message to one connected agent.
    pub fn notify(
        &self,
        client_id: ClientId,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<(), SupervisorError> {
        let conn = self
            .shared
            .clients
            .get(&client_id)
            .ok_or(SupervisorError::UnknownClient(client_id))?;
        conn.channel.notify(command, payload)?;
        Ok(())
    }

    /// Relay an HTTP request addressed to a sibling capability.
    pub async fn proxy_fetch(&self, request: FetchRequest) -> Result<crate::proxy::FetchResponse, ProxyError> {
        self.shared.proxy.fetch(request).await
    }

    /// Close the transport and remove the per-run files. Idempotent.
    ///
    /// Connections are closed politely: each writer drains its queued frames
    /// before the socket goes away.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(run_id = %self.run.id(), "Supervisor closing");

        if let Some(task) = self
            .accept_task
            .lock()
            .expect("accept task lock poisoned")
            .take()
        {
            task.abort();
        }

        let ids: Vec<ClientId> = self.shared.clients.iter().map(|e| *e.key()).collect();
        for client_id in ids {
            if let Some((_, conn)) = self.shared.clients.remove(&client_id) {
                conn.channel.close();
                conn.reader.abort();
                // Give the writer a chance to flush in-flight sends.
                let _ = tokio::time::timeout(std::time::Duration::from_secs(2), conn.writer).await;
            }
        }
        self.shared.request_owners.clear();

        if let Err(e) = std::fs::remove_file(self.run.socket_path())
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "Failed to remove control socket");
        }
        if let Err(e) = self.run.remove() {
            tracing::warn!(error = %e, "Failed to remove run descriptor");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Some(task) = self
                .accept_task
                .lock()
                .expect("accept task lock poisoned")
                .take()
            {
                task.abort();
            }
            let _ = std::fs::remove_file(self.run.socket_path());
            let _ = self.run.remove();
        }
    }
}

/// Wire up one accepted connection: channel endpoint, handlers, IO tasks.
fn add_client(shared: &Arc<Shared>, stream: tokio::net::UnixStream) {
    let client_id = ClientId::new();
    let (read_half, write_half) = stream.into_split();

    let (channel, outbound_rx) = Channel::new(true);
    register_host_handlers(shared, &channel, client_id);

    let writer = spawn_writer(outbound_rx, FramedWrite::new(write_half, JsonLineCodec::new()));

    // The reader waits for registration so a fast EOF cannot race the insert
    // below and leave a dead entry in the client set.
    let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
    let reader = {
        let shared = Arc::clone(shared);
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let _ = registered_rx.await;
            read_loop(
                &shared,
                client_id,
                &channel,
                FramedRead::new(read_half, JsonLineCodec::new()),
            )
            .await;
        })
    };

    shared.clients.insert(
        client_id,
        ClientConnection {
            channel,
            reader,
            writer,
        },
    );
    let _ = registered_tx.send(());
    tracing::info!(client = %client_id, "Agent connected");
    let _ = shared
        .events_tx
        .send(SupervisorEvent::ClientConnected(client_id));
}

/// Handlers the supervisor serves to its agents.
fn register_host_handlers(shared: &Arc<Shared>, channel: &Arc<Channel>, client_id: ClientId) {
    let proxy = shared.proxy.clone();
    channel.handle(commands::FETCH, move |payload| {
        let proxy = proxy.clone();
        async move {
            let request: FetchRequest = serde_json::from_value(payload)
                .map_err(|e| HandlerRejection(format!("invalid fetch request: {e}")))?;
            let response = proxy
                .fetch(request)
                .await
                .map_err(|e| HandlerRejection(e.to_string()))?;
            serde_json::to_value(response).map_err(|e| HandlerRejection(e.to_string()))
        }
    });

    let weak = Arc::downgrade(shared);
    channel.handle(commands::URL, move |payload| {
        let shared = weak.upgrade();
        async move {
            let Some(shared) = shared else {
                return Err(HandlerRejection::from("supervisor gone"));
            };
            let Some(url) = payload.as_str().map(str::to_string) else {
                return Err(HandlerRejection::from("url payload must be a string"));
            };
            tracing::info!(client = %client_id, %url, "Capability URL reported");
            shared.url_tx.send_replace(Some(url.clone()));
            let _ = shared
                .events_tx
                .send(SupervisorEvent::UrlReported { client: client_id, url });
            Ok(serde_json::Value::Null)
        }
    });

    let weak = Arc::downgrade(shared);
    channel.handle(commands::FATAL_ERROR, move |payload| {
        let shared = weak.upgrade();
        async move {
            let Some(shared) = shared else {
                return Err(HandlerRejection::from("supervisor gone"));
            };
            let message = payload
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            tracing::error!(client = %client_id, %message, "Child reported fatal error");
            let _ = shared.events_tx.send(SupervisorEvent::ChildFatal {
                client: client_id,
                message,
            });
            Ok(serde_json::Value::Null)
        }
    });

    channel.handle(commands::LOG, move |payload| async move {
        emit_child_log(client_id, &payload);
        Ok(serde_json::Value::Null)
    });
}

/// Re-emit a forwarded child log event into the host's tracing stream.
fn emit_child_log(client_id: ClientId, payload: &serde_json::Value) {
    let target = payload
        .get("target")
        .and_then(|v| v.as_str())
        .unwrap_or("child");
    let level = payload.get("level").and_then(|v| v.as_str()).unwrap_or("info");
    let message = payload.get("message").and_then(|v| v.as_str()).unwrap_or("");

    match level {
        "error" => {
            tracing::error!(target: "hostlet::child", client = %client_id, %target, "{}", message)
        }
        "warn" => {
            tracing::warn!(target: "hostlet::child", client = %client_id, %target, "{}", message)
        }
        "debug" => {
            tracing::debug!(target: "hostlet::child", client = %client_id, %target, "{}", message)
        }
        "trace" => {
            tracing::trace!(target: "hostlet::child", client = %client_id, %target, "{}", message)
        }
        _ => tracing::info!(target: "hostlet::child", client = %client_id, %target, "{}", message),
    }
}

/// Per-connection read loop. Responses are routed through the request-owner
/// table; everything else goes to the connection's own channel endpoint.
async fn read_loop(
    shared: &Arc<Shared>,
    client_id: ClientId,
    channel: &Arc<Channel>,
    mut reader: FramedRead<tokio::net::unix::OwnedReadHalf, JsonLineCodec<ControlMessage>>,
) {
    use futures::StreamExt;

    loop {
        match reader.next().await {
            Some(Ok(msg)) => {
                if msg.kind == MessageKind::Response {
                    let Some(req_id) = msg.req_id else {
                        tracing::warn!(client = %client_id, "Response without reqId, dropping");
                        continue;
                    };
                    match shared.request_owners.get(&req_id).map(|e| *e.value()) {
                        Some(owner) if owner == client_id => {
                            shared.request_owners.remove(&req_id);
                            channel.dispatch(msg);
                        }
                        Some(other) => {
                            tracing::warn!(
                                client = %client_id,
                                owner = %other,
                                %req_id,
                                "Response from non-owning connection, dropping"
                            );
                        }
                        None => {
                            tracing::debug!(client = %client_id, %req_id, "Response for unknown request, dropping");
                        }
                    }
                } else {
                    channel.dispatch(msg);
                }
            }
            Some(Err(e)) => {
                let failure = ChannelFailure::from_io(e);
                tracing::error!(client = %client_id, error = %failure, "Connection corrupted");
                let code = failure.exit_code();
                shared.disconnect(client_id);
                (shared.fatal_hook)(code, &failure.to_string());
                break;
            }
            None => {
                shared.disconnect(client_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::connect_with_retry;
    use crate::channel::{EXIT_MESSAGE_HANDLING_FAILED, drive};
    use crate::context::HostConfig;
    use serde_json::json;
    use std::time::Duration;

    fn test_ctx(dir: &tempfile::TempDir) -> HostContext {
        HostContext::new(HostConfig::default().with_runtime_dir(dir.path()))
    }

    /// In-process stand-in for an agent: lenient channel over a client socket.
    async fn fake_agent(
        run: &RunDescriptor,
    ) -> (
        Arc<Channel>,
        tokio::task::JoinHandle<Result<(), ChannelFailure>>,
    ) {
        let stream = connect_with_retry(run.socket_path(), 20, Duration::from_millis(10))
            .await
            .unwrap();
        let (read_half, write_half) = stream.into_split();
        let (channel, rx) = Channel::new(false);
        spawn_writer(rx, FramedWrite::new(write_half, JsonLineCodec::new()));
        let driver = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                drive(&channel, FramedRead::new(read_half, JsonLineCodec::new())).await
            })
        };
        (channel, driver)
    }

    async fn wait_for_clients(supervisor: &ProcessSupervisor, n: usize) {
        for _ in 0..100 {
            if supervisor.client_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} connected clients, saw {}", supervisor.client_count());
    }

    #[tokio::test]
    async fn prepare_writes_descriptor_and_binds_socket() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);

        let mut data = serde_json::Map::new();
        data.insert("name".to_string(), json!("api"));
        let supervisor = ProcessSupervisor::prepare(
            &ctx,
            SupervisorConfig::new().with_context_data(data.clone()),
        )
        .unwrap();

        let run = supervisor.descriptor();
        assert!(run.descriptor_path().exists());
        assert!(run.socket_path().exists());

        let loaded = RunDescriptor::load(dir.path(), run.id().clone()).unwrap();
        assert_eq!(loaded.context_data(), &data);

        supervisor.close().await;
        assert!(!run.descriptor_path().exists());
        assert!(!run.socket_path().exists());
    }

    #[tokio::test]
    async fn url_notify_reaches_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        let mut events = supervisor.subscribe();

        let (agent, _driver) = fake_agent(supervisor.descriptor()).await;
        agent
            .notify(commands::URL, json!("http://127.0.0.1:51000"))
            .unwrap();

        loop {
            match events.recv().await {
                Some(SupervisorEvent::UrlReported { url, .. }) => {
                    assert_eq!(url, "http://127.0.0.1:51000");
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
        assert_eq!(
            supervisor.latest_url(),
            Some("http://127.0.0.1:51000".to_string())
        );
        supervisor.close().await;
    }

    #[tokio::test]
    async fn responses_route_only_to_owning_connection() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();

        // Two agents connected concurrently, as during a hand-off.
        let (agent_a, _da) = fake_agent(supervisor.descriptor()).await;
        let (agent_b, _db) = fake_agent(supervisor.descriptor()).await;
        wait_for_clients(&supervisor, 2).await;

        agent_a.handle(commands::HEALTHCHECK, |_p| async move {
            Ok(json!({"status": "healthy", "from": "a"}))
        });
        agent_b.handle(commands::HEALTHCHECK, |_p| async move {
            Ok(json!({"status": "healthy", "from": "b"}))
        });

        // The owner map pins each request to the connection it was sent on;
        // with both agents answering, each response lands with its caller.
        let ids = supervisor.client_ids();
        for id in ids {
            let result = supervisor
                .request(id, commands::HEALTHCHECK, json!(null))
                .await
                .unwrap();
            assert_eq!(result.get("status"), Some(&json!("healthy")));
        }
        assert!(supervisor.shared.request_owners.is_empty());
        supervisor.close().await;
    }

    /// Raw connection that never answers anything: keeps supervisor requests
    /// pending so routing and disconnect behavior can be observed.
    async fn mute_client(
        supervisor: &ProcessSupervisor,
        events: &mut SupervisorEvents,
    ) -> (tokio::net::UnixStream, ClientId) {
        let stream = connect_with_retry(
            supervisor.descriptor().socket_path(),
            20,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let id = loop {
            match events.recv().await.expect("event stream open") {
                SupervisorEvent::ClientConnected(id) => break id,
                _ => continue,
            }
        };
        (stream, id)
    }

    async fn write_frame(stream: &mut tokio::net::UnixStream, msg: &ControlMessage) {
        use tokio::io::AsyncWriteExt;
        let mut line = serde_json::to_vec(msg).unwrap();
        line.push(b'\n');
        stream.write_all(&line).await.unwrap();
    }

    #[tokio::test]
    async fn forged_response_from_non_owner_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        let mut events = supervisor.subscribe();

        // Two connections overlap, as during a process hand-off.
        let (mut sock_a, id_a) = mute_client(&supervisor, &mut events).await;
        let (mut sock_b, _id_b) = mute_client(&supervisor, &mut events).await;

        let request = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                supervisor
                    .request(id_a, commands::HEALTHCHECK, json!(null))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let req_id = *supervisor
            .shared
            .request_owners
            .iter()
            .next()
            .expect("pending request recorded")
            .key();
        let forged =
            ControlMessage::response(req_id, commands::HEALTHCHECK, json!({"from": "forged"}));

        // The non-owner's copy must be dropped, not delivered.
        write_frame(&mut sock_b, &forged).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!request.is_finished());
        assert!(!supervisor.shared.request_owners.is_empty());

        // The owner's copy resolves it.
        write_frame(&mut sock_a, &forged).await;
        let result = request.await.unwrap().unwrap();
        assert_eq!(result.get("from"), Some(&json!("forged")));
        assert!(supervisor.shared.request_owners.is_empty());
        supervisor.close().await;
    }

    #[tokio::test]
    async fn disconnect_fails_pending_requests_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        let mut events = supervisor.subscribe();

        let (stream, client_id) = mute_client(&supervisor, &mut events).await;

        let request = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                supervisor
                    .request(client_id, commands::HEALTHCHECK, json!(null))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!request.is_finished());

        // Superseded child goes away mid-request.
        drop(stream);

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, SupervisorError::Channel(ChannelError::Closed)));
        assert_eq!(supervisor.client_count(), 0);
        supervisor.close().await;
    }

    #[tokio::test]
    async fn malformed_frame_triggers_fatal_hook_with_message_code() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);

        let (fatal_tx, fatal_rx) = tokio::sync::oneshot::channel::<(i32, String)>();
        let fatal_tx = StdMutex::new(Some(fatal_tx));
        let hook: FatalHook = Arc::new(move |code, detail| {
            if let Some(tx) = fatal_tx.lock().unwrap().take() {
                let _ = tx.send((code, detail.to_string()));
            }
        });

        let supervisor =
            ProcessSupervisor::prepare(&ctx, SupervisorConfig::new().with_fatal_hook(hook))
                .unwrap();

        let mut stream = connect_with_retry(
            supervisor.descriptor().socket_path(),
            20,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        stream.write_all(b"NOT-JSON\n").await.unwrap();

        let (code, detail) = fatal_rx.await.unwrap();
        assert_eq!(code, EXIT_MESSAGE_HANDLING_FAILED);
        assert!(detail.contains("message handling failed"), "detail: {detail}");
        supervisor.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        supervisor.close().await;
        supervisor.close().await;
        assert!(supervisor.is_closed());
    }

    #[tokio::test]
    async fn env_for_child_carries_run_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();

        let env = supervisor.env_for_child();
        assert!(env.contains(&(RUN_ID_ENV.to_string(), supervisor.run_id().to_string())));
        assert!(env.contains(&(
            RUNTIME_DIR_ENV.to_string(),
            dir.path().display().to_string()
        )));
        supervisor.close().await;
    }

    #[test]
    fn activation_guard_restores_environment() {
        // Distinct keys so parallel tests activating real supervisors cannot
        // interfere with the assertion.
        let vars = vec![
            ("HOSTLET_TEST_GUARD_A".to_string(), "one".to_string()),
            ("HOSTLET_TEST_GUARD_B".to_string(), "two".to_string()),
        ];
        // SAFETY: key is unique to this test.
        unsafe { std::env::set_var("HOSTLET_TEST_GUARD_A", "previous") };

        {
            let _guard = ActivationGuard::set(&vars);
            assert_eq!(std::env::var("HOSTLET_TEST_GUARD_A").unwrap(), "one");
            assert_eq!(std::env::var("HOSTLET_TEST_GUARD_B").unwrap(), "two");
        }

        // Pre-existing value restored; absent value removed again.
        assert_eq!(std::env::var("HOSTLET_TEST_GUARD_A").unwrap(), "previous");
        assert!(std::env::var("HOSTLET_TEST_GUARD_B").is_err());
    }
}

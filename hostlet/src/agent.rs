//! Worker bootstrap agent - the first code that runs inside the child.
//!
//! Contract: locate the run descriptor via the inherited run id, populate the
//! agent context from its data, connect to the control channel, install crash
//! handlers, and only then hand control to user code through the `AppHost`
//! seam. The hosted app reports its bound URL through `AgentHandle` and
//! reaches siblings through `AgentHandle::fetch`, which rewrites `*.internal`
//! requests into proxy-fetch calls instead of real egress.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{ControlMessage, commands};
use crate::bridge::transport::connect_with_retry;
use crate::channel::{
    Channel, ChannelError, EXIT_CHILD_FATAL, HandlerRejection, drive, spawn_writer,
};
use crate::descriptor::{DescriptorError, RUN_ID_ENV, RUNTIME_DIR_ENV, RunDescriptor, RunId};
use crate::health::CheckResult;
use crate::proxy::{FetchRequest, FetchResponse, ProxyError, perform_fetch};

/// Invoked on unrecoverable agent failures after the `fatal_error` notify.
/// The default exits the process with the given code.
pub type AgentFatalHook = Arc<dyn Fn(i32, &str) + Send + Sync>;

fn default_fatal_hook() -> AgentFatalHook {
    Arc::new(|code, detail| {
        tracing::error!(exit_code = code, %detail, "Agent fatal, exiting");
        std::process::exit(code);
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("failed to reach control socket within attempt window: {0}")]
    Connect(std::io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("hosted application failed: {0}")]
    App(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AgentFetchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("malformed fetch response: {0}")]
    Decode(serde_json::Error),
    #[error(transparent)]
    Direct(#[from] ProxyError),
}

pub struct AgentConfig {
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    /// Install a process-wide panic hook that reports `fatal_error`.
    pub install_panic_hook: bool,
    /// Register the control-channel tracing layer as the global subscriber.
    pub forward_tracing: bool,
    pub fatal_hook: AgentFatalHook,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 40,
            connect_delay: Duration::from_millis(250),
            install_panic_hook: true,
            forward_tracing: true,
            fatal_hook: default_fatal_hook(),
        }
    }
}

type CheckCallback = Arc<dyn Fn() -> CheckResult + Send + Sync>;
type MetricsCallback = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Process-wide context populated from the run descriptor's `contextData`.
#[derive(Debug, Clone)]
pub struct AgentContext {
    data: serde_json::Map<String, serde_json::Value>,
    loader: Option<String>,
    scripts: Vec<String>,
}

impl AgentContext {
    fn from_descriptor(run: &RunDescriptor) -> Self {
        Self {
            data: run.context_data().clone(),
            loader: run.loader().map(str::to_string),
            scripts: run.scripts().to_vec(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.data
    }

    /// Loader module the host asked to run before user code.
    pub fn loader(&self) -> Option<&str> {
        self.loader.as_deref()
    }

    /// Extra startup scripts, surfaced to the hosted app in declaration order.
    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }
}

struct Callbacks {
    health: StdMutex<Option<CheckCallback>>,
    readiness: StdMutex<Option<CheckCallback>>,
    metrics: StdMutex<Option<MetricsCallback>>,
}

/// The hosted application's view of its agent.
pub struct AgentHandle {
    channel: Arc<Channel>,
    context: AgentContext,
    http: reqwest::Client,
    callbacks: Arc<Callbacks>,
    shutdown: CancellationToken,
}

impl AgentHandle {
    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    /// Report the hosted server's bound address to the supervisor.
    ///
    /// Translates the app's own bind event into the `url` notification the
    /// lifecycle manager is waiting on.
    pub fn report_url(&self, url: impl Into<String>) -> Result<(), ChannelError> {
        self.channel
            .notify(commands::URL, serde_json::Value::String(url.into()))
    }

    /// Cancelled when the supervisor asks this capability to close.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Override the default-healthy health check.
    pub fn set_health_check(&self, check: impl Fn() -> CheckResult + Send + Sync + 'static) {
        *self.callbacks.health.lock().expect("health lock poisoned") = Some(Arc::new(check));
    }

    /// Override the default-healthy readiness check.
    pub fn set_readiness_check(&self, check: impl Fn() -> CheckResult + Send + Sync + 'static) {
        *self
            .callbacks
            .readiness
            .lock()
            .expect("readiness lock poisoned") = Some(Arc::new(check));
    }

    /// Register the metrics snapshot collector.
    pub fn set_metrics_collector(
        &self,
        collect: impl Fn() -> serde_json::Value + Send + Sync + 'static,
    ) {
        *self.callbacks.metrics.lock().expect("metrics lock poisoned") = Some(Arc::new(collect));
    }

    /// Dispatch an outbound HTTP request.
    ///
    /// Requests addressed to the reserved `*.internal` domain are relayed
    /// over the control channel; everything else goes out directly.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, AgentFetchError> {
        if request.internal_host().is_some() {
            let payload = serde_json::to_value(&request)
                .map_err(|e| AgentFetchError::Decode(e))?;
            let value = self.channel.send(commands::FETCH, payload).await?;
            return serde_json::from_value(value).map_err(AgentFetchError::Decode);
        }

        let url = reqwest::Url::parse(&request.url).map_err(|e| {
            AgentFetchError::Direct(ProxyError::InvalidUrl {
                url: request.url.clone(),
                message: e.to_string(),
            })
        })?;
        Ok(perform_fetch(&self.http, url, &request).await?)
    }

    /// Report an uncaught application error before the process dies.
    pub fn notify_fatal(&self, message: &str) {
        let _ = self
            .channel
            .notify(commands::FATAL_ERROR, serde_json::Value::String(message.into()));
    }
}

/// The seam user code plugs into: `run` is invoked only after the bootstrap
/// has connected the channel and installed crash handlers.
#[async_trait::async_trait]
pub trait AppHost: Send + Sync + 'static {
    async fn run(&self, agent: Arc<AgentHandle>) -> Result<(), anyhow::Error>;
}

/// Entry point for the child process: locate the descriptor through the
/// inherited environment, then bootstrap.
pub async fn run_agent<H: AppHost>(host: Arc<H>, config: AgentConfig) -> Result<(), AgentError> {
    let run_id = std::env::var(RUN_ID_ENV).map_err(|_| AgentError::MissingEnv(RUN_ID_ENV))?;
    let runtime_dir = std::env::var(RUNTIME_DIR_ENV)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());

    let descriptor = RunDescriptor::load(runtime_dir, RunId::from_string(run_id))?;
    run_agent_with(host, descriptor, config).await
}

/// Bootstrap against an already-loaded descriptor.
pub async fn run_agent_with<H: AppHost>(
    host: Arc<H>,
    descriptor: RunDescriptor,
    config: AgentConfig,
) -> Result<(), AgentError> {
    let stream = connect_with_retry(
        descriptor.socket_path(),
        config.connect_attempts,
        config.connect_delay,
    )
    .await
    .map_err(AgentError::Connect)?;

    let (read_half, write_half) = stream.into_split();
    // Lenient endpoint: host commands this agent does not implement are
    // tolerated, not fatal.
    let (channel, outbound_rx) = Channel::new(false);
    let writer = spawn_writer(outbound_rx, FramedWrite::new(write_half, JsonLineCodec::new()));

    let shutdown = CancellationToken::new();
    let callbacks = Arc::new(Callbacks {
        health: StdMutex::new(None),
        readiness: StdMutex::new(None),
        metrics: StdMutex::new(None),
    });
    register_agent_handlers(&channel, &callbacks, &shutdown);

    if config.install_panic_hook {
        install_panic_hook(&channel, Arc::clone(&config.fatal_hook));
    }
    if config.forward_tracing {
        use tracing_subscriber::layer::SubscriberExt;
        let layer = crate::agent_tracing_layer::AgentTracingLayer::new(channel.raw_sender());
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(layer),
        );
    }

    let handle = Arc::new(AgentHandle {
        channel: Arc::clone(&channel),
        context: AgentContext::from_descriptor(&descriptor),
        http: reqwest::Client::new(),
        callbacks,
        shutdown: shutdown.clone(),
    });

    let driver = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            drive(&channel, FramedRead::new(read_half, JsonLineCodec::new())).await
        })
    };
    let driver_abort = driver.abort_handle();

    tracing::info!(run_id = %descriptor.id(), "Agent bootstrapped, starting user code");

    let result = tokio::select! {
        app_result = host.run(Arc::clone(&handle)) => {
            match app_result {
                Ok(()) => Ok(()),
                Err(e) => {
                    handle.notify_fatal(&e.to_string());
                    Err(AgentError::App(e))
                }
            }
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Close requested, agent shutting down");
            Ok(())
        }
        drive_result = driver => {
            match drive_result {
                Ok(Ok(())) => {
                    tracing::warn!("Control channel closed by supervisor");
                    Ok(())
                }
                Ok(Err(failure)) => {
                    (config.fatal_hook)(failure.exit_code(), &failure.to_string());
                    Err(AgentError::Channel(ChannelError::Closed))
                }
                Err(_) => Err(AgentError::Channel(ChannelError::Closed)),
            }
        }
    };

    // Let queued frames (fatal notifications included) reach the wire, then
    // release every channel reference so the writer can finish.
    channel.close();
    driver_abort.abort();
    drop(channel);
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;

    result
}

fn register_agent_handlers(
    channel: &Arc<Channel>,
    callbacks: &Arc<Callbacks>,
    shutdown: &CancellationToken,
) {
    let shutdown = shutdown.clone();
    channel.handle(commands::CLOSE, move |payload| {
        let shutdown = shutdown.clone();
        async move {
            let signal = payload
                .get("signal")
                .and_then(|v| v.as_str())
                .unwrap_or("SIGTERM");
            tracing::info!(%signal, "Polite close received");
            shutdown.cancel();
            Ok(serde_json::json!({"closing": true}))
        }
    });

    let cb = Arc::clone(callbacks);
    channel.handle(commands::HEALTHCHECK, move |_payload| {
        let check = cb.health.lock().expect("health lock poisoned").clone();
        async move {
            let result = match check {
                Some(check) => check(),
                None => CheckResult::healthy(),
            };
            serde_json::to_value(result).map_err(|e| HandlerRejection(e.to_string()))
        }
    });

    let cb = Arc::clone(callbacks);
    channel.handle(commands::READINESS, move |_payload| {
        let check = cb.readiness.lock().expect("readiness lock poisoned").clone();
        async move {
            let result = match check {
                Some(check) => check(),
                None => CheckResult::healthy(),
            };
            serde_json::to_value(result).map_err(|e| HandlerRejection(e.to_string()))
        }
    });

    let cb = Arc::clone(callbacks);
    channel.handle(commands::METRICS, move |_payload| {
        let collect = cb.metrics.lock().expect("metrics lock poisoned").clone();
        async move {
            Ok(match collect {
                Some(collect) => collect(),
                None => serde_json::json!({}),
            })
        }
    });
}

/// Translate a process panic into a `fatal_error` notification plus a
/// distinct exit code, so the supervisor can tell crashes from clean exits.
fn install_panic_hook(channel: &Arc<Channel>, fatal_hook: AgentFatalHook) {
    let sender = channel.raw_sender();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = info.to_string();
        let _ = sender.send(ControlMessage::notify(
            commands::FATAL_ERROR,
            serde_json::Value::String(message.clone()),
        ));
        previous(info);
        // One beat for the writer task to flush the notification.
        std::thread::sleep(Duration::from_millis(100));
        fatal_hook(EXIT_CHILD_FATAL, &message);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HostConfig, HostContext};
    use crate::supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorEvent};
    use serde_json::json;

    fn test_ctx(dir: &tempfile::TempDir) -> HostContext {
        HostContext::new(HostConfig::default().with_runtime_dir(dir.path()))
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            connect_attempts: 20,
            connect_delay: Duration::from_millis(10),
            install_panic_hook: false,
            forward_tracing: false,
            fatal_hook: Arc::new(|_code, _detail| {}),
        }
    }

    /// App that reports a URL then waits for the close request.
    struct UrlReporter {
        url: String,
    }

    #[async_trait::async_trait]
    impl AppHost for UrlReporter {
        async fn run(&self, agent: Arc<AgentHandle>) -> Result<(), anyhow::Error> {
            agent.report_url(&self.url)?;
            agent.shutdown_requested().cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn agent_bootstraps_and_reports_url() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);

        let mut data = serde_json::Map::new();
        data.insert("name".to_string(), json!("api"));
        let supervisor = ProcessSupervisor::prepare(
            &ctx,
            SupervisorConfig::new().with_context_data(data),
        )
        .unwrap();
        let mut events = supervisor.subscribe();

        let descriptor = RunDescriptor::load(dir.path(), supervisor.run_id().clone()).unwrap();
        assert_eq!(descriptor.context_data().get("name"), Some(&json!("api")));

        let agent_task = tokio::spawn(run_agent_with(
            Arc::new(UrlReporter {
                url: "http://127.0.0.1:51000".to_string(),
            }),
            descriptor,
            agent_config(),
        ));

        let (client, url) = loop {
            match events.recv().await.expect("event stream open") {
                SupervisorEvent::UrlReported { client, url } => break (client, url),
                _ => continue,
            }
        };
        assert_eq!(url, "http://127.0.0.1:51000");

        // Polite close makes the app's run() return.
        let ack = supervisor
            .request(client, commands::CLOSE, json!({"signal": "SIGTERM"}))
            .await
            .unwrap();
        assert_eq!(ack.get("closing"), Some(&json!(true)));

        agent_task.await.unwrap().unwrap();
        supervisor.close().await;
    }

    #[tokio::test]
    async fn default_health_check_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        let mut events = supervisor.subscribe();

        let descriptor = RunDescriptor::load(dir.path(), supervisor.run_id().clone()).unwrap();
        let agent_task = tokio::spawn(run_agent_with(
            Arc::new(UrlReporter {
                url: "http://127.0.0.1:51001".to_string(),
            }),
            descriptor,
            agent_config(),
        ));

        let client = loop {
            match events.recv().await.expect("event stream open") {
                SupervisorEvent::UrlReported { client, .. } => break client,
                _ => continue,
            }
        };

        let result = supervisor
            .request(client, commands::HEALTHCHECK, json!(null))
            .await
            .unwrap();
        assert_eq!(result.get("status"), Some(&json!("healthy")));

        let metrics = supervisor
            .request(client, commands::METRICS, json!(null))
            .await
            .unwrap();
        assert_eq!(metrics, json!({}));

        supervisor
            .request(client, commands::CLOSE, json!({"signal": "SIGTERM"}))
            .await
            .unwrap();
        agent_task.await.unwrap().unwrap();
        supervisor.close().await;
    }

    /// App that registers an unhealthy check, reports, then waits.
    struct Unhealthy;

    #[async_trait::async_trait]
    impl AppHost for Unhealthy {
        async fn run(&self, agent: Arc<AgentHandle>) -> Result<(), anyhow::Error> {
            agent.set_health_check(|| CheckResult::unhealthy("db unreachable"));
            agent.report_url("http://127.0.0.1:51002")?;
            agent.shutdown_requested().cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn registered_health_check_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        let mut events = supervisor.subscribe();

        let descriptor = RunDescriptor::load(dir.path(), supervisor.run_id().clone()).unwrap();
        let agent_task = tokio::spawn(run_agent_with(Arc::new(Unhealthy), descriptor, agent_config()));

        let client = loop {
            match events.recv().await.expect("event stream open") {
                SupervisorEvent::UrlReported { client, .. } => break client,
                _ => continue,
            }
        };

        let result = supervisor
            .request(client, commands::HEALTHCHECK, json!(null))
            .await
            .unwrap();
        assert_eq!(result.get("status"), Some(&json!("unhealthy")));
        assert_eq!(result.get("detail"), Some(&json!("db unreachable")));

        supervisor
            .request(client, commands::CLOSE, json!({"signal": "SIGTERM"}))
            .await
            .unwrap();
        agent_task.await.unwrap().unwrap();
        supervisor.close().await;
    }

    /// App whose user code fails immediately.
    struct Crashing;

    #[async_trait::async_trait]
    impl AppHost for Crashing {
        async fn run(&self, _agent: Arc<AgentHandle>) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("listen EADDRINUSE"))
        }
    }

    #[tokio::test]
    async fn app_failure_notifies_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(&ctx, SupervisorConfig::new()).unwrap();
        let mut events = supervisor.subscribe();

        let descriptor = RunDescriptor::load(dir.path(), supervisor.run_id().clone()).unwrap();
        let agent_task = tokio::spawn(run_agent_with(Arc::new(Crashing), descriptor, agent_config()));

        let message = loop {
            match events.recv().await.expect("event stream open") {
                SupervisorEvent::ChildFatal { message, .. } => break message,
                _ => continue,
            }
        };
        assert_eq!(message, "listen EADDRINUSE");

        let err = agent_task.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::App(_)));
        supervisor.close().await;
    }

    #[tokio::test]
    async fn connect_failure_is_fatal_to_agent() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = RunDescriptor::new(
            RunId::from_string("7-7"),
            dir.path(),
            serde_json::Map::new(),
            None,
            Vec::new(),
        );

        let mut config = agent_config();
        config.connect_attempts = 2;
        let err = run_agent_with(Arc::new(Crashing), descriptor, config)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Connect(_)));
    }

    #[tokio::test]
    async fn internal_fetch_goes_over_the_channel() {
        use crate::proxy::StaticResolver;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Sibling HTTP endpoint the supervisor will relay to.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sibling = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let supervisor = ProcessSupervisor::prepare(
            &ctx,
            SupervisorConfig::new().with_resolver(Arc::new(StaticResolver::new([(
                "db".to_string(),
                format!("http://{addr}"),
            )]))),
        )
        .unwrap();
        let mut events = supervisor.subscribe();

        /// App that fetches a sibling and reports the body as its URL.
        struct Fetcher;

        #[async_trait::async_trait]
        impl AppHost for Fetcher {
            async fn run(&self, agent: Arc<AgentHandle>) -> Result<(), anyhow::Error> {
                let response = agent
                    .fetch(FetchRequest::get("http://db.internal/ping"))
                    .await?;
                let body = String::from_utf8(response.body_bytes()?)?;
                agent.report_url(format!("fetched:{}:{}", response.status, body))?;
                agent.shutdown_requested().cancelled().await;
                Ok(())
            }
        }

        let descriptor = RunDescriptor::load(dir.path(), supervisor.run_id().clone()).unwrap();
        let agent_task = tokio::spawn(run_agent_with(Arc::new(Fetcher), descriptor, agent_config()));

        let (client, url) = loop {
            match events.recv().await.expect("event stream open") {
                SupervisorEvent::UrlReported { client, url } => break (client, url),
                _ => continue,
            }
        };
        assert_eq!(url, "fetched:200:ok");

        supervisor
            .request(client, commands::CLOSE, json!({"signal": "SIGTERM"}))
            .await
            .unwrap();
        agent_task.await.unwrap().unwrap();
        supervisor.close().await;
        sibling.await.unwrap();
    }
}

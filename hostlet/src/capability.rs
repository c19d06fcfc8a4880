//! Capability lifecycle manager.
//!
//! One `Capability` wraps one hosted application's full lifecycle behind a
//! forward-only state machine:
//!
//! ```text
//! empty --init()--> init --start()--> started --stop()--> stopping --> stopped
//!                     \------------------(dependency failure)--------> stopped
//! ```
//!
//! `init` resolves declared dependencies before any process work happens.
//! `start` drives the supervisor's prepare/activate sequence and waits for
//! the agent's `url` notification. `stop` escalates: polite close request,
//! then the configured signal, then an unconditional kill, each step a
//! distinct logged event.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::bridge::protocol::{ClientId, commands};
use crate::context::{HostConfig, HostContext};
use crate::events::HostEvent;
use crate::health::CheckResult;
use crate::proxy::{NullResolver, SiblingResolver};
use crate::registry::{CapabilityAdapter, WatchConfig};
use crate::spawn::BuildError;
use crate::supervisor::{
    ProcessSupervisor, SupervisorConfig, SupervisorError, SupervisorEvent, SupervisorEvents,
};
use crate::version::VersionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Empty,
    Init,
    Started,
    Stopping,
    Stopped,
}

impl CapabilityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::Init => "init",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Where the lifecycle manager asks about other capabilities' status.
pub trait CapabilityDirectory: Send + Sync {
    fn status_of(&self, name: &str) -> Option<CapabilityStatus>;
}

/// A dependency never started and the host is shutting down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("dependencies not started: [{}]", missing.join(", "))]
pub struct DependencyError {
    pub missing: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("cannot start from status `{0}`")]
    InvalidState(CapabilityStatus),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Launch(#[from] crate::spawn::LaunchError),
    #[error("child exited before reporting a URL (code {code:?})")]
    Exited { code: Option<i32> },
    #[error("child reported fatal error during start: {0}")]
    ChildFatal(String),
    #[error("timed out waiting for the capability URL")]
    Timeout,
    #[error("supervisor went away during start")]
    Aborted,
}

/// Stop errors are cloneable so every concurrent caller observes the same
/// terminal outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StopError {
    #[error("failed to deliver {signal}: {message}")]
    Signal { signal: String, message: String },
    #[error("child survived the kill signal; supervision failed")]
    Unkillable,
}

/// Handle to one supervised child process. Abstracted so shutdown escalation
/// can be exercised against a scripted stand-in.
#[async_trait::async_trait]
pub trait ManagedChild: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Deliver a named signal (e.g. "SIGTERM") to the child.
    fn signal(&self, name: &str) -> io::Result<()>;

    /// Deliver the unconditional kill signal.
    fn force_kill(&self) -> io::Result<()>;

    /// Resolve once the child has exited, with its exit code if known.
    /// Safe to await from multiple callers.
    async fn exited(&self) -> Option<i32>;

    /// Whether the child has already exited.
    fn has_exited(&self) -> bool;
}

#[cfg(unix)]
fn parse_signal(name: &str) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    match name {
        "SIGTERM" | "TERM" => Some(Signal::SIGTERM),
        "SIGINT" | "INT" => Some(Signal::SIGINT),
        "SIGHUP" | "HUP" => Some(Signal::SIGHUP),
        "SIGQUIT" | "QUIT" => Some(Signal::SIGQUIT),
        "SIGUSR1" | "USR1" => Some(Signal::SIGUSR1),
        "SIGUSR2" | "USR2" => Some(Signal::SIGUSR2),
        "SIGKILL" | "KILL" => Some(Signal::SIGKILL),
        _ => None,
    }
}

/// Real child process backed by `tokio::process`.
///
/// A reaper task owns the `Child`; exit status is published through a watch
/// channel so any number of waiters can observe it.
pub struct SpawnedChild {
    pid: Option<u32>,
    process_group: bool,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

impl SpawnedChild {
    pub fn new(mut child: tokio::process::Child, process_group: bool) -> Arc<Self> {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for child");
                    None
                }
            };
            exit_tx.send_replace(Some(code));
        });
        Arc::new(Self {
            pid,
            process_group,
            exit_rx,
        })
    }

    #[cfg(unix)]
    fn deliver(&self, signal: nix::sys::signal::Signal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        let result = if self.process_group {
            nix::sys::signal::killpg(pid, signal)
        } else {
            nix::sys::signal::kill(pid, signal)
        };
        match result {
            Ok(()) => Ok(()),
            // Already gone; the reaper will observe the exit.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

#[async_trait::async_trait]
impl ManagedChild for SpawnedChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn signal(&self, name: &str) -> io::Result<()> {
        let signal = parse_signal(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("unknown signal `{name}`"))
        })?;
        self.deliver(signal)
    }

    #[cfg(not(unix))]
    fn signal(&self, _name: &str) -> io::Result<()> {
        self.force_kill()
    }

    #[cfg(unix)]
    fn force_kill(&self) -> io::Result<()> {
        self.deliver(nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    fn force_kill(&self) -> io::Result<()> {
        Ok(())
    }

    async fn exited(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Options for one `start` invocation.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Listen hint handed to the hosted app through the descriptor data.
    pub listen: Option<String>,
}

/// Escalating shutdown against one child.
///
/// Step 1 races the polite close request against `exit_timeout`. Step 2
/// delivers the configured signal and waits `kill_timeout`. Step 3 delivers
/// the unconditional kill and waits `final_wait`; surviving that is a
/// supervision failure.
pub(crate) async fn escalate_shutdown(
    config: &HostConfig,
    child: &Arc<dyn ManagedChild>,
    polite: Option<(Arc<ProcessSupervisor>, ClientId)>,
) -> Result<Option<i32>, StopError> {
    if let Some((supervisor, client)) = polite {
        let signal = config.termination_signal.clone();
        tokio::spawn(async move {
            match supervisor
                .request(
                    client,
                    commands::CLOSE,
                    serde_json::json!({"signal": signal}),
                )
                .await
            {
                Ok(_) => tracing::debug!(%client, "Close request acknowledged"),
                Err(e) => tracing::debug!(%client, error = %e, "Close request did not resolve"),
            }
        });
    }

    tracing::info!(pid = ?child.pid(), timeout = ?config.exit_timeout, "Waiting for child to exit politely");
    if let Ok(code) = tokio::time::timeout(config.exit_timeout, child.exited()).await {
        return Ok(code);
    }

    tracing::warn!(
        pid = ?child.pid(),
        signal = %config.termination_signal,
        "Exit deadline elapsed, sending termination signal"
    );
    child
        .signal(&config.termination_signal)
        .map_err(|e| StopError::Signal {
            signal: config.termination_signal.clone(),
            message: e.to_string(),
        })?;
    if let Ok(code) = tokio::time::timeout(config.kill_timeout, child.exited()).await {
        return Ok(code);
    }

    tracing::warn!(pid = ?child.pid(), "Kill deadline elapsed, sending unconditional kill");
    child.force_kill().map_err(|e| StopError::Signal {
        signal: "SIGKILL".to_string(),
        message: e.to_string(),
    })?;
    match tokio::time::timeout(config.final_wait, child.exited()).await {
        Ok(code) => Ok(code),
        Err(_) => {
            tracing::error!(pid = ?child.pid(), "Child survived SIGKILL");
            Err(StopError::Unkillable)
        }
    }
}

/// Wait for the agent to report its URL, failing fast on child death or a
/// fatal report.
async fn wait_for_url(
    events: &mut SupervisorEvents,
    child: &Arc<dyn ManagedChild>,
) -> Result<(ClientId, String), StartError> {
    let exited = {
        let child = Arc::clone(child);
        async move { child.exited().await }
    };
    tokio::pin!(exited);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SupervisorEvent::UrlReported { client, url }) => return Ok((client, url)),
                Some(SupervisorEvent::ChildFatal { message, .. }) => {
                    return Err(StartError::ChildFatal(message));
                }
                Some(_) => continue,
                None => return Err(StartError::Aborted),
            },
            code = &mut exited => return Err(StartError::Exited { code }),
        }
    }
}

struct ActiveRun {
    supervisor: Arc<ProcessSupervisor>,
    child: Arc<dyn ManagedChild>,
    client: Option<ClientId>,
}

/// One managed unit wrapping a hosted application's lifecycle.
pub struct Capability {
    name: String,
    ctx: HostContext,
    adapter: Arc<dyn CapabilityAdapter>,
    dependencies: Vec<String>,
    resolver: Arc<dyn SiblingResolver>,
    context_data: serde_json::Map<String, serde_json::Value>,

    status_tx: watch::Sender<CapabilityStatus>,
    run: tokio::sync::Mutex<Option<ActiveRun>>,
    current_url: StdMutex<Option<String>>,
    /// Serializes stop; concurrent callers all observe the stored outcome.
    stop_gate: tokio::sync::Mutex<Option<Result<(), StopError>>>,
    metrics_configured: AtomicBool,
}

/// Status and identity snapshot for `info()`.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub kind: crate::registry::AppKind,
    pub status: CapabilityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub version: VersionInfo,
}

impl Capability {
    pub fn new(
        name: impl Into<String>,
        ctx: HostContext,
        adapter: Arc<dyn CapabilityAdapter>,
    ) -> Self {
        let (status_tx, _) = watch::channel(CapabilityStatus::Empty);
        Self {
            name: name.into(),
            ctx,
            adapter,
            dependencies: Vec::new(),
            resolver: Arc::new(NullResolver),
            context_data: serde_json::Map::new(),
            status_tx,
            run: tokio::sync::Mutex::new(None),
            current_url: StdMutex::new(None),
            stop_gate: tokio::sync::Mutex::new(None),
            metrics_configured: AtomicBool::new(false),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SiblingResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_context_data(
        mut self,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.context_data = data;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> CapabilityStatus {
        *self.status_tx.borrow()
    }

    /// Watch status transitions. Dropping the receiver unsubscribes.
    pub fn status_stream(&self) -> watch::Receiver<CapabilityStatus> {
        self.status_tx.subscribe()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn set_status(&self, status: CapabilityStatus) {
        let previous = *self.status_tx.borrow();
        if previous != status {
            tracing::info!(capability = %self.name, from = %previous, to = %status, "Status change");
            self.status_tx.send_replace(status);
        }
    }

    /// Resolve declared dependencies, then enter `init`.
    ///
    /// Dependencies already reported started are not waited on; if every
    /// dependency is satisfied this never suspends. Otherwise it waits for
    /// `CapabilityStarted` broadcasts until the set drains, or rejects with
    /// the still-missing set when the host signals `Stopping`.
    pub async fn init(&self, directory: &dyn CapabilityDirectory) -> Result<(), DependencyError> {
        if self.status() != CapabilityStatus::Empty {
            return Ok(());
        }
        self.set_status(CapabilityStatus::Init);

        // Subscribe before sampling so a start landing in between is not lost.
        let mut events = self.ctx.events.subscribe();
        let mut missing: Vec<String> = self
            .dependencies
            .iter()
            .filter(|dep| directory.status_of(dep) != Some(CapabilityStatus::Started))
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        tracing::info!(capability = %self.name, ?missing, "Waiting on dependencies");
        loop {
            match events.recv().await {
                Some(HostEvent::CapabilityStarted(name)) => {
                    missing.retain(|dep| *dep != name);
                    if missing.is_empty() {
                        return Ok(());
                    }
                }
                Some(HostEvent::Stopping) | None => {
                    self.set_status(CapabilityStatus::Stopped);
                    return Err(DependencyError { missing });
                }
            }
        }
    }

    /// Prepare a run, launch the child and wait for its URL.
    pub async fn start(&self, options: StartOptions) -> Result<String, StartError> {
        if self.status() != CapabilityStatus::Init {
            return Err(StartError::InvalidState(self.status()));
        }

        let mut context_data = self.context_data.clone();
        context_data.insert(
            "name".to_string(),
            serde_json::Value::String(self.name.clone()),
        );
        if let Some(listen) = options.listen {
            context_data.insert("listen".to_string(), serde_json::Value::String(listen));
        }

        let supervisor = ProcessSupervisor::prepare(
            &self.ctx,
            SupervisorConfig::new()
                .with_context_data(context_data)
                .with_resolver(Arc::clone(&self.resolver)),
        )?;
        let mut events = supervisor.subscribe();

        let child = self.launch(&supervisor)?;

        let waited = tokio::time::timeout(
            self.ctx.config.start_timeout,
            wait_for_url(&mut events, &child),
        )
        .await;

        match waited {
            Ok(Ok((client, url))) => {
                *self.run.lock().await = Some(ActiveRun {
                    supervisor,
                    child,
                    client: Some(client),
                });
                *self.current_url.lock().expect("url lock poisoned") = Some(url.clone());
                self.set_status(CapabilityStatus::Started);
                self.ctx
                    .events
                    .emit(HostEvent::CapabilityStarted(self.name.clone()));
                Ok(url)
            }
            Ok(Err(e)) => {
                self.abort_start(&supervisor, &child).await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(capability = %self.name, "Start timed out waiting for URL");
                self.abort_start(&supervisor, &child).await;
                Err(StartError::Timeout)
            }
        }
    }

    fn launch(
        &self,
        supervisor: &Arc<ProcessSupervisor>,
    ) -> Result<Arc<dyn ManagedChild>, StartError> {
        let mut options = self.adapter.spawn_options(supervisor.descriptor());
        for (key, value) in supervisor.env_for_child() {
            options = options.env(key, value);
        }

        // Activation is scoped exactly around the spawn; the guard restores
        // the previous environment even when launch fails.
        let _activation = supervisor.activate();
        let child = options.launch()?;
        let child: Arc<dyn ManagedChild> = SpawnedChild::new(child, options.uses_process_group());
        Ok(child)
    }

    async fn abort_start(&self, supervisor: &Arc<ProcessSupervisor>, child: &Arc<dyn ManagedChild>) {
        if let Err(e) = child.force_kill() {
            tracing::warn!(error = %e, "Failed to kill child after aborted start");
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), child.exited()).await;
        supervisor.close().await;
        self.set_status(CapabilityStatus::Stopped);
    }

    /// Run the adapter's build command, when it has one.
    pub async fn build(&self) -> Result<(), BuildError> {
        match self.adapter.build_options() {
            Some(options) => {
                tracing::info!(capability = %self.name, command = %options.command_line(), "Building");
                options.run_to_completion().await
            }
            None => Ok(()),
        }
    }

    /// Graceful shutdown with escalation. Idempotent: every caller observes
    /// the same terminal outcome, including callers that arrive mid-stop.
    pub async fn stop(&self) -> Result<(), StopError> {
        let mut gate = self.stop_gate.lock().await;
        if let Some(outcome) = gate.as_ref() {
            return outcome.clone();
        }
        if self.status() == CapabilityStatus::Stopped {
            return Ok(());
        }

        let run = self.run.lock().await.take();
        let outcome = match run {
            Some(run) => {
                self.set_status(CapabilityStatus::Stopping);
                let polite = run.client.map(|client| (Arc::clone(&run.supervisor), client));
                let result = escalate_shutdown(&self.ctx.config, &run.child, polite).await;
                run.supervisor.close().await;
                match result {
                    Ok(code) => {
                        tracing::info!(capability = %self.name, code = ?code, "Child exited");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            // Nothing running; decommission the record directly.
            None => Ok(()),
        };

        *self.current_url.lock().expect("url lock poisoned") = None;
        self.set_status(CapabilityStatus::Stopped);
        *gate = Some(outcome.clone());
        outcome
    }

    pub fn url(&self) -> Option<String> {
        self.current_url.lock().expect("url lock poisoned").clone()
    }

    pub fn info(&self) -> CapabilityInfo {
        let version = match self.adapter.app_version() {
            Some(app) => VersionInfo::new().with_app(app),
            None => VersionInfo::new(),
        };
        CapabilityInfo {
            name: self.name.clone(),
            kind: self.adapter.kind(),
            status: self.status(),
            url: self.url(),
            version,
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        self.adapter.watch_config()
    }

    /// One-shot metrics configuration gate.
    ///
    /// Returns true only for the call that flips the gate; repeated
    /// configuration updates must not double-register collectors.
    pub fn configure_metrics(&self) -> bool {
        !self.metrics_configured.swap(true, Ordering::SeqCst)
    }

    pub fn metrics_ready(&self) -> bool {
        self.metrics_configured.load(Ordering::SeqCst)
    }

    /// Metrics snapshot from the hosted app; empty when none is registered.
    pub async fn metrics(&self) -> serde_json::Value {
        match self.channel_request(commands::METRICS).await {
            Some(Ok(value)) => value,
            _ => serde_json::json!({}),
        }
    }

    /// App-registered health check; healthy by default.
    pub async fn custom_health_check(&self) -> CheckResult {
        self.run_check(commands::HEALTHCHECK).await
    }

    /// App-registered readiness check; healthy by default.
    pub async fn custom_readiness_check(&self) -> CheckResult {
        self.run_check(commands::READINESS).await
    }

    async fn run_check(&self, command: &str) -> CheckResult {
        match self.channel_request(command).await {
            None => CheckResult::healthy(),
            Some(Ok(value)) => serde_json::from_value(value)
                .unwrap_or_else(|e| CheckResult::unhealthy(format!("malformed check result: {e}"))),
            Some(Err(e)) => match e {
                SupervisorError::Channel(ref channel_err) if channel_err.is_no_handler() => {
                    CheckResult::healthy()
                }
                other => CheckResult::unhealthy(other.to_string()),
            },
        }
    }

    /// Issue a request to the active client, if the capability is running.
    async fn channel_request(
        &self,
        command: &str,
    ) -> Option<Result<serde_json::Value, SupervisorError>> {
        let (supervisor, client) = {
            let run = self.run.lock().await;
            let run = run.as_ref()?;
            (Arc::clone(&run.supervisor), run.client?)
        };
        Some(
            tokio::time::timeout(
                Duration::from_secs(10),
                supervisor.request(client, command, serde_json::Value::Null),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SupervisorError::Channel(
                    crate::channel::ChannelError::Remote("check timed out".to_string()),
                ))
            }),
        )
    }
}

//! Adapter registry: a closed set of application kinds resolved to concrete
//! adapters once at configuration time.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::RunDescriptor;
use crate::spawn::SpawnOptions;

/// The closed set of hosted application kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// Long-running server that binds a URL.
    Server,
    /// Framework dev/build command wrapping a server.
    DevCommand,
    /// Pre-built static site served by a bundled file server.
    StaticSite,
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Server => "server",
            Self::DevCommand => "dev_command",
            Self::StaticSite => "static_site",
        };
        f.write_str(s)
    }
}

/// File-watching hints a capability exposes for dev mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// Build/start strategy for one application kind.
///
/// Adapters produce spawn options; launching, supervision and teardown stay
/// uniform in the lifecycle manager. Framework-specific adapters live outside
/// this crate and register themselves at configuration time.
pub trait CapabilityAdapter: Send + Sync {
    fn kind(&self) -> AppKind;

    /// Command that starts the hosted application for this run.
    fn spawn_options(&self, run: &RunDescriptor) -> SpawnOptions;

    /// Build command, when the app kind has a build step.
    fn build_options(&self) -> Option<SpawnOptions> {
        None
    }

    fn watch_config(&self) -> WatchConfig {
        WatchConfig::default()
    }

    /// Hosted framework version, when the adapter can report one.
    fn app_version(&self) -> Option<String> {
        None
    }
}

/// In-tree adapter that runs a configured command verbatim.
pub struct CommandAdapter {
    kind: AppKind,
    start: SpawnOptions,
    build: Option<SpawnOptions>,
    watch: WatchConfig,
}

impl CommandAdapter {
    pub fn new(kind: AppKind, start: SpawnOptions) -> Self {
        Self {
            kind,
            start,
            build: None,
            watch: WatchConfig::default(),
        }
    }

    pub fn with_build(mut self, build: SpawnOptions) -> Self {
        self.build = Some(build);
        self
    }

    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }
}

impl CapabilityAdapter for CommandAdapter {
    fn kind(&self) -> AppKind {
        self.kind
    }

    fn spawn_options(&self, _run: &RunDescriptor) -> SpawnOptions {
        self.start.clone()
    }

    fn build_options(&self) -> Option<SpawnOptions> {
        self.build.clone()
    }

    fn watch_config(&self) -> WatchConfig {
        self.watch.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no adapter registered for app kind `{0}`")]
    Unknown(AppKind),
}

/// Registry keyed by `AppKind`; resolution happens once at configuration time.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<AppKind, Arc<dyn CapabilityAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn CapabilityAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn resolve(&self, kind: AppKind) -> Result<Arc<dyn CapabilityAdapter>, RegistryError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(RegistryError::Unknown(kind))
    }
}

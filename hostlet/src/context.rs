//! Explicit host context: configuration and event hub handed down through
//! every component constructor. No ambient globals.

use std::path::PathBuf;
use std::time::Duration;

use crate::events::HostEvents;

/// Tunables for one host instance.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory for per-run sockets and descriptor files.
    pub runtime_dir: PathBuf,
    /// How long `start()` waits for the child to report its URL.
    pub start_timeout: Duration,
    /// How long the polite close request may take before escalation.
    pub exit_timeout: Duration,
    /// How long the forced signal may take before the unconditional kill.
    pub kill_timeout: Duration,
    /// Last bounded wait after SIGKILL; survival past this is a supervision failure.
    pub final_wait: Duration,
    /// Signal delivered on escalation, also named in the polite close payload.
    pub termination_signal: String,
    /// Agent connect attempts before giving up on the transport.
    pub connect_attempts: u32,
    /// Delay between agent connect attempts.
    pub connect_delay: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir(),
            start_timeout: Duration::from_secs(300),
            exit_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            final_wait: Duration::from_secs(5),
            termination_signal: "SIGTERM".to_string(),
            connect_attempts: 40,
            connect_delay: Duration::from_millis(250),
        }
    }
}

impl HostConfig {
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_final_wait(mut self, wait: Duration) -> Self {
        self.final_wait = wait;
        self
    }

    pub fn with_termination_signal(mut self, signal: impl Into<String>) -> Self {
        self.termination_signal = signal.into();
        self
    }
}

/// Shared context for a host instance: configuration plus the typed event hub.
///
/// Created once at construction and passed down; components never reach for
/// process-global state for these concerns.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub config: HostConfig,
    pub events: HostEvents,
}

impl HostContext {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            events: HostEvents::new(),
        }
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HostConfig::default();
        assert_eq!(config.termination_signal, "SIGTERM");
        assert!(config.exit_timeout > Duration::ZERO);
        assert!(config.connect_attempts > 0);
    }

    #[test]
    fn builder_overrides() {
        let config = HostConfig::default()
            .with_exit_timeout(Duration::from_millis(50))
            .with_termination_signal("SIGINT");
        assert_eq!(config.exit_timeout, Duration::from_millis(50));
        assert_eq!(config.termination_signal, "SIGINT");
    }
}

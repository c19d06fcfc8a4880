//! Version information for hostlet.

/// Hostlet version from Cargo.toml
pub const HOSTLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported through `Capability::info()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Hostlet runtime version.
    pub hostlet: &'static str,
    /// Hosted application/framework version, when the adapter reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            hostlet: HOSTLET_VERSION,
            app: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, version: String) -> Self {
        self.app = Some(version);
        self
    }
}

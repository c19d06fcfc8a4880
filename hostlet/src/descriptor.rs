//! Run identity and the bootstrap descriptor handed to the child.
//!
//! The descriptor is written once per activation to a well-known temp path,
//! read exactly once by the agent at startup, and removed on close. Socket and
//! descriptor paths are both derived from the run id, so the file itself only
//! carries `{ data, loader, scripts }`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Environment variable carrying the run id into the child.
pub const RUN_ID_ENV: &str = "HOSTLET_RUN_ID";

/// Environment variable carrying the runtime directory into the child.
///
/// Defaults to the platform temp dir on both sides; exported so a host with a
/// non-default runtime dir still points the child at the right descriptor.
pub const RUNTIME_DIR_ENV: &str = "HOSTLET_RUNTIME_DIR";

/// Unique identity of one capability activation: `<pid>-<unix_millis>`.
///
/// Process identity plus a timestamp keeps ids unique across hosts; a
/// monotonic clamp keeps them unique across back-to-back activations within
/// one process, where two calls can land on the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

impl RunId {
    pub fn generate() -> Self {
        let mut stamp = chrono::Utc::now().timestamp_millis();
        loop {
            let last = LAST_STAMP.load(Ordering::Relaxed);
            if stamp <= last {
                stamp = last + 1;
            }
            if LAST_STAMP
                .compare_exchange(last, stamp, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        Self(format!("{}-{}", std::process::id(), stamp))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn descriptor_path(runtime_dir: &Path, run_id: &RunId) -> PathBuf {
    runtime_dir.join(format!("hostlet-{}.json", run_id))
}

pub fn socket_path(runtime_dir: &Path, run_id: &RunId) -> PathBuf {
    runtime_dir.join(format!("hostlet-{}.sock", run_id))
}

/// On-disk shape of the descriptor file.
#[derive(Debug, Serialize, Deserialize)]
struct DescriptorFile {
    data: serde_json::Map<String, serde_json::Value>,
    loader: Option<String>,
    #[serde(default)]
    scripts: Vec<String>,
}

/// Bootstrap payload for one capability activation.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    id: RunId,
    runtime_dir: PathBuf,
    context_data: serde_json::Map<String, serde_json::Value>,
    loader: Option<String>,
    scripts: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("no descriptor found for run `{run_id}` at {}", .path.display())]
    Missing { run_id: RunId, path: PathBuf },
    #[error("failed to read descriptor: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse descriptor: {0}")]
    Parse(#[from] serde_json::Error),
}

impl RunDescriptor {
    pub fn new(
        id: RunId,
        runtime_dir: impl Into<PathBuf>,
        context_data: serde_json::Map<String, serde_json::Value>,
        loader: Option<String>,
        scripts: Vec<String>,
    ) -> Self {
        Self {
            id,
            runtime_dir: runtime_dir.into(),
            context_data,
            loader,
            scripts,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.runtime_dir, &self.id)
    }

    pub fn descriptor_path(&self) -> PathBuf {
        descriptor_path(&self.runtime_dir, &self.id)
    }

    pub fn context_data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.context_data
    }

    pub fn loader(&self) -> Option<&str> {
        self.loader.as_deref()
    }

    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    /// Serialize to the per-run temp file.
    pub fn write(&self) -> io::Result<()> {
        let file = DescriptorFile {
            data: self.context_data.clone(),
            loader: self.loader.clone(),
            scripts: self.scripts.clone(),
        };
        let bytes = serde_json::to_vec(&file)?;
        std::fs::write(self.descriptor_path(), bytes)
    }

    /// Read the descriptor the parent wrote for `run_id`.
    pub fn load(runtime_dir: impl Into<PathBuf>, run_id: RunId) -> Result<Self, DescriptorError> {
        let runtime_dir = runtime_dir.into();
        let path = descriptor_path(&runtime_dir, &run_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DescriptorError::Missing { run_id, path });
            }
            Err(e) => return Err(e.into()),
        };
        let file: DescriptorFile = serde_json::from_slice(&bytes)?;
        Ok(Self {
            id: run_id,
            runtime_dir,
            context_data: file.data,
            loader: file.loader,
            scripts: file.scripts,
        })
    }

    /// Remove the temp file. Safe to call when the file is already gone.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(self.descriptor_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_data() -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("name".to_string(), json!("api"));
        data.insert("port_hint".to_string(), json!(51000));
        data.insert("flags".to_string(), json!({"dev": true, "watch": ["src"]}));
        data
    }

    #[test]
    fn run_ids_are_unique_within_process() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(&format!("{}-", std::process::id())));
    }

    #[test]
    fn paths_derive_from_run_id() {
        let id = RunId::from_string("42-1700000000000");
        let dir = PathBuf::from("/tmp");
        assert_eq!(
            descriptor_path(&dir, &id),
            PathBuf::from("/tmp/hostlet-42-1700000000000.json")
        );
        assert_eq!(
            socket_path(&dir, &id),
            PathBuf::from("/tmp/hostlet-42-1700000000000.sock")
        );
    }

    #[test]
    fn write_load_roundtrip_preserves_context_data() {
        let dir = tempfile::tempdir().unwrap();
        let id = RunId::generate();

        let descriptor = RunDescriptor::new(
            id.clone(),
            dir.path(),
            sample_data(),
            Some("file:///srv/loader.js".to_string()),
            vec!["file:///srv/init.js".to_string()],
        );
        descriptor.write().unwrap();

        let loaded = RunDescriptor::load(dir.path(), id).unwrap();
        assert_eq!(loaded.context_data(), &sample_data());
        assert_eq!(loaded.loader(), Some("file:///srv/loader.js"));
        assert_eq!(loaded.scripts(), &["file:///srv/init.js".to_string()]);

        // Byte-for-byte equivalence of the data section across the round trip.
        assert_eq!(
            serde_json::to_vec(loaded.context_data()).unwrap(),
            serde_json::to_vec(descriptor.context_data()).unwrap()
        );
    }

    #[test]
    fn load_missing_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunDescriptor::load(dir.path(), RunId::from_string("1-2")).unwrap_err();
        assert!(matches!(err, DescriptorError::Missing { .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = RunDescriptor::new(
            RunId::generate(),
            dir.path(),
            serde_json::Map::new(),
            None,
            Vec::new(),
        );
        descriptor.write().unwrap();
        descriptor.remove().unwrap();
        descriptor.remove().unwrap();
        assert!(!descriptor.descriptor_path().exists());
    }
}

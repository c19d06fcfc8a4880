//! Socket transport for supervisor-agent IPC.
//!
//! One Unix domain socket per run, addressed by a filesystem path derived from
//! the run id. The supervisor side binds and accepts multiple concurrent
//! connections (a child being relaunched may overlap with its predecessor
//! draining); the agent side connects exactly once, with a bounded retry
//! window to cover the gap between spawn and listener readiness.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};

/// Listening end of the control-channel socket, owned by the supervisor.
///
/// Removes the socket file on cleanup; a stale file from a crashed previous
/// run with the same path is replaced at bind time.
pub struct ChannelListener {
    path: PathBuf,
    listener: UnixListener,
}

impl ChannelListener {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(path = %path.display(), "Bound control socket");
        Ok(Self { path, listener })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(&self) -> io::Result<()> {
        if self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Removing control socket");
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to remove control socket");
        }
    }
}

/// Connect from the agent side, retrying while the listener comes up.
///
/// A child that cannot reach the channel within the attempt window cannot be
/// supervised, so the caller treats the error as fatal.
pub async fn connect_with_retry(
    path: impl AsRef<Path>,
    attempts: u32,
    delay: Duration,
) -> io::Result<UnixStream> {
    let path = path.as_ref();
    let mut last_err = None;

    for attempt in 0..attempts.max(1) {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                tracing::debug!(path = %path.display(), attempt, "Connected to control socket");
                return Ok(stream);
            }
            Err(e) => {
                tracing::trace!(path = %path.display(), attempt, error = %e, "Connect attempt failed");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "control socket never became reachable")
    }))
}

//! Host-wide typed events.
//!
//! Capabilities coordinate through explicit channels rather than an ambient
//! emitter: `CapabilityStarted` unblocks dependency waits, `Stopping` cancels
//! them. Unsubscribing is dropping the stream.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A capability reached `Started`; carries its name.
    CapabilityStarted(String),
    /// The orchestrator is shutting the whole host down.
    Stopping,
}

/// Broadcast hub owned by the host context.
#[derive(Debug, Clone)]
pub struct HostEvents {
    tx: broadcast::Sender<HostEvent>,
}

impl HostEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> HostEventStream {
        HostEventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn emit(&self, event: HostEvent) {
        // No receivers is fine; nothing is waiting on us.
        let _ = self.tx.send(event);
    }
}

impl Default for HostEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscription to host events. Dropping it unsubscribes.
pub struct HostEventStream {
    rx: broadcast::Receiver<HostEvent>,
}

impl HostEventStream {
    /// Next event, skipping over lagged gaps; `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Host event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

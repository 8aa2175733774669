// THEORY:
// The event bus lets any number of observers (a status page, a notifier, a test)
// watch a session without the supervisor knowing they exist. It is a thin wrapper
// over a `tokio::sync::broadcast` channel: publishing never blocks and never fails,
// even with nobody listening, and an observer that falls behind simply loses the
// oldest events.

use crate::core_modules::segment_writer::{ArtifactFile, Codec};
use crate::frame::StreamGeometry;
use crate::supervisor::SessionState;
use std::path::PathBuf;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    StreamOpened {
        address: String,
        geometry: StreamGeometry,
    },
    EpisodeStarted {
        path: PathBuf,
        codec: Codec,
        used_fallback: bool,
    },
    EpisodeFinalized(ArtifactFile),
    EpisodeAborted {
        reason: String,
        artifact: Option<ArtifactFile>,
    },
    ConnectFailed {
        reason: String,
        retry_in_secs: u64,
    },
    ReadFault {
        reason: String,
        retry_in_secs: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // An error only means nobody is subscribed.
        let _ = self.tx.send(event);
    }

    pub fn observers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

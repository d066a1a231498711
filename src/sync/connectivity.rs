//! Online/offline tracking.
//!
//! The platform signal (or the heartbeat probe) is fed into
//! [`ConnectivityMonitor::observe`]. Subscribers receive one
//! [`ConnectivityChange`] per transition. An unknown state counts as online:
//! a false positive only costs a sync attempt that fails at the network layer.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::broadcast;
use tracing::info;

const UNKNOWN: u8 = 0;
const ONLINE: u8 = 1;
const OFFLINE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Unknown,
    Online,
    Offline,
}

impl Connectivity {
    fn from_u8(value: u8) -> Self {
        match value {
            ONLINE => Connectivity::Online,
            OFFLINE => Connectivity::Offline,
            _ => Connectivity::Unknown,
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, Connectivity::Offline)
    }
}

/// Emitted once per observed online/offline transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub online: bool,
    pub at: DateTime<Utc>,
}

pub struct ConnectivityMonitor {
    state: AtomicU8,
    changes: broadcast::Sender<ConnectivityChange>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: AtomicU8::new(UNKNOWN),
            changes,
        }
    }

    pub fn state(&self) -> Connectivity {
        Connectivity::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Record the latest connectivity reading. Returns the change when the
    /// effective online flag flipped.
    pub fn observe(&self, online: bool) -> Option<ConnectivityChange> {
        let next = if online { ONLINE } else { OFFLINE };
        let previous = Connectivity::from_u8(self.state.swap(next, Ordering::SeqCst));

        if previous.is_online() == online {
            return None;
        }

        let change = ConnectivityChange {
            online,
            at: Utc::now(),
        };
        info!(
            "Connectivity changed: {}",
            if online { "online" } else { "offline" }
        );
        // No subscribers is fine.
        let _ = self.changes.send(change);
        Some(change)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange> {
        self.changes.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

//! Shared types for the hub.
//!
//! This module defines:
//! - channel aliases between connections, callers and the hub loop
//! - `RegisterRequest`: a new connection handed to the hub loop
//! - `SharedRegistry`: the one lock around the connection registry
//! - hub-wide counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hub_core::{ConnectionId, Envelope, HubError, Registry};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::connection::{Connection, ConnectionHandle};

/// Registry of live connections, keyed by id and by user.
///
/// Only the hub loop takes the write lock; `stats`, `send_to_user` and
/// friends take short read locks and work on snapshots.
pub type SharedRegistry = Arc<RwLock<Registry<ConnectionHandle>>>;

/// A freshly accepted connection waiting to be registered.
///
/// `ack` receives the total connection count once the connection is in
/// the registry and its pumps are running.
pub struct RegisterRequest {
    pub connection: Connection,
    pub ack: oneshot::Sender<Result<usize, HubError>>,
}

/// Register stream: gateway → hub loop.
pub type RegisterTx = mpsc::Sender<RegisterRequest>;
pub type RegisterRx = mpsc::Receiver<RegisterRequest>;

/// Unregister stream: connection pumps → hub loop.
pub type UnregisterTx = mpsc::Sender<ConnectionId>;
pub type UnregisterRx = mpsc::Receiver<ConnectionId>;

/// Broadcast stream: callers → hub loop.
pub type BroadcastTx = mpsc::Sender<Envelope>;
pub type BroadcastRx = mpsc::Receiver<Envelope>;

/// Monotonic hub-wide counters.
#[derive(Debug, Default)]
pub struct HubCounters {
    connections_accepted: AtomicU64,
    messages_dropped: AtomicU64,
    broadcasts: AtomicU64,
}

impl HubCounters {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`HubCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Connections that made it into the registry.
    pub connections_accepted: u64,

    /// Envelopes dropped because an outbound queue was full.
    pub messages_dropped: u64,

    /// Broadcasts fanned out by the hub loop.
    pub broadcasts: u64,
}

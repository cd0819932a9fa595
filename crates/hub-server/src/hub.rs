//! The hub: public handle over the registry and the coordinating loop.
//!
//! `Hub` is cheap to clone; every clone talks to the same loop and the
//! same registry. Create one per independent set of connections.
//! Dropping the last clone starts the same teardown as
//! [`Hub::shutdown`], without waiting for it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use hub_core::{ConnectionId, Envelope, HubError, HubStats, Registry, UserId};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionHandle, PumpContext, Transport};
use crate::handler::MessageHandler;
use crate::hub_task::{fan_out, run_hub_loop, HubStreams};
use crate::types::{
    BroadcastTx, CounterSnapshot, HubCounters, RegisterRequest, RegisterTx, SharedRegistry,
};

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    registry: SharedRegistry,
    register_tx: RegisterTx,
    broadcast_tx: BroadcastTx,
    counters: Arc<HubCounters>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HubInner {
    // Last handle gone without `shutdown()`: the loop closes every
    // connection and exits on its own.
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Hub {
    /// Spawn the coordinating loop and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: HubConfig, handler: Arc<dyn MessageHandler>) -> Hub {
        let capacity = config.event_queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);

        let registry: SharedRegistry = Arc::new(RwLock::new(Registry::new()));
        let counters = Arc::new(HubCounters::default());
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = PumpContext {
            unregister_tx,
            handler,
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
            read_idle_timeout: config.read_idle_timeout,
            write_deadline: config.write_deadline,
            keepalive_interval: config.keepalive_interval,
        };

        let streams = HubStreams {
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        let loop_handle = tokio::spawn(run_hub_loop(
            streams,
            registry.clone(),
            counters.clone(),
            ctx,
            config.shutdown_grace,
        ));

        Hub {
            inner: Arc::new(HubInner {
                config,
                registry,
                register_tx,
                broadcast_tx,
                counters,
                shutdown,
                tracker,
                loop_handle: Mutex::new(Some(loop_handle)),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Wrap `transport` for `user_id` and register it.
    ///
    /// The caller has already authenticated `user_id`; the hub does not
    /// check it again.
    pub async fn accept<T: Transport>(
        &self,
        transport: T,
        user_id: UserId,
    ) -> Result<ConnectionHandle, HubError> {
        let connection = Connection::accept(transport, user_id, &self.inner.config);
        self.register(connection).await
    }

    /// Hand an accepted connection to the hub loop.
    ///
    /// Resolves once the connection is in the registry, its welcome is
    /// queued and its pumps are running.
    pub async fn register(&self, connection: Connection) -> Result<ConnectionHandle, HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        let handle = connection.handle();
        let (ack, ack_rx) = oneshot::channel();
        self.inner
            .register_tx
            .send(RegisterRequest { connection, ack })
            .await
            .map_err(|_| HubError::ShuttingDown)?;

        match ack_rx.await {
            Ok(Ok(_total)) => Ok(handle),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HubError::ShuttingDown),
        }
    }

    /// Enqueue `envelope` on every connection of `user_id`.
    ///
    /// Returns the number of connections attempted, not how many
    /// accepted it: delivery is fire-and-forget.
    pub async fn send_to_user(&self, user_id: &UserId, envelope: Envelope) -> usize {
        let targets = {
            let guard = self.inner.registry.read().await;
            guard.connections_for_user(user_id)
        };

        fan_out(&targets, &envelope, &self.inner.counters);
        targets.len()
    }

    /// Queue `envelope` for delivery to every connection.
    ///
    /// Returns as soon as the broadcast is queued for the hub loop.
    pub fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        self.inner.broadcast_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::BroadcastQueueFull,
            mpsc::error::TrySendError::Closed(_) => HubError::LoopClosed,
        })
    }

    pub async fn stats(&self) -> HubStats {
        self.inner.registry.read().await.stats()
    }

    pub async fn connected_user_ids(&self) -> BTreeSet<UserId> {
        self.inner.registry.read().await.connected_user_ids()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    pub async fn connection(&self, conn_id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.registry.read().await.get(conn_id).cloned()
    }

    /// Force one connection closed. Returns `false` if it is unknown.
    pub async fn close_connection(&self, conn_id: ConnectionId) -> bool {
        match self.connection(conn_id).await {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Send `reason` as a notice to every connection of `user_id`, then
    /// close them. Returns how many connections were closed.
    pub async fn disconnect_user(&self, user_id: &UserId, reason: &str) -> usize {
        let targets = {
            let guard = self.inner.registry.read().await;
            guard.connections_for_user(user_id)
        };

        for conn in &targets {
            let _ = conn.enqueue(Envelope::notice(reason).with_user(user_id.clone()));
            conn.close();
        }

        info!(user_id = %user_id, connections = targets.len(), reason, "user disconnected");
        targets.len()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the hub starts shutting down.
    ///
    /// Cancelling the returned token does not shut the hub down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Stop the hub: refuse new work, close every connection and wait
    /// (bounded by the shutdown grace period) for them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let loop_handle = match self.inner.loop_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(loop_handle) = loop_handle {
            if let Err(e) = loop_handle.await {
                error!(error = %e, "hub loop terminated abnormally");
            }
        }

        let tracker = &self.inner.tracker;
        tracker.close();
        if timeout(self.inner.config.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = tracker.len(), "pump tasks still running after shutdown grace");
        }
    }
}

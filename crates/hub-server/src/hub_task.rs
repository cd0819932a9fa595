//! Central hub loop.
//!
//! This task is the only writer of the registry. It processes three
//! streams:
//! - register:   queue `welcome`, insert, mark active, start pumps
//! - unregister: remove (unknown ids are a no-op)
//! - broadcast:  enqueue on a snapshot of every connection
//!
//! On shutdown it drains what is already queued, forces every
//! connection closed and waits (bounded by the grace period) for their
//! pumps to report back.

use std::sync::Arc;
use std::time::Duration;

use hub_core::{ConnectionId, EnqueueError, Envelope, HubError};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, PumpContext};
use crate::types::{BroadcastRx, HubCounters, RegisterRequest, RegisterRx, SharedRegistry, UnregisterRx};

pub(crate) struct HubStreams {
    pub register_rx: RegisterRx,
    pub unregister_rx: UnregisterRx,
    pub broadcast_rx: BroadcastRx,
}

/// Run the coordinating loop until the shutdown token fires.
pub(crate) async fn run_hub_loop(
    mut streams: HubStreams,
    registry: SharedRegistry,
    counters: Arc<HubCounters>,
    ctx: PumpContext,
    shutdown_grace: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            Some(conn_id) = streams.unregister_rx.recv() => {
                handle_unregister(&registry, conn_id).await;
            }
            Some(req) = streams.register_rx.recv() => {
                handle_register(&registry, &counters, &ctx, req).await;
            }
            Some(envelope) = streams.broadcast_rx.recv() => {
                handle_broadcast(&registry, &counters, envelope).await;
            }
        }
    }

    shut_down(streams, &registry, shutdown_grace).await;
}

async fn handle_register(
    registry: &SharedRegistry,
    counters: &HubCounters,
    ctx: &PumpContext,
    req: RegisterRequest,
) {
    let RegisterRequest { connection, ack } = req;
    let handle = connection.handle();

    // Queued before the connection is reachable, so nothing overtakes it.
    let welcome = Envelope::welcome(
        handle.user_id().clone(),
        json!({ "connectionId": handle.id().0 }),
    );
    if let Err(EnqueueError::QueueFull) = handle.enqueue(welcome) {
        counters.record_dropped();
    }

    let total = {
        let mut guard = registry.write().await;
        guard.insert(handle.id(), handle.user_id().clone(), handle.clone())
    };
    handle.mark_active();
    counters.record_accepted();

    info!(
        conn_id = %handle.id(),
        user_id = %handle.user_id(),
        total,
        "connection registered"
    );

    connection.start_pumps(ctx);
    let _ = ack.send(Ok(total));
}

async fn handle_unregister(registry: &SharedRegistry, conn_id: ConnectionId) {
    let (removed, remaining) = {
        let mut guard = registry.write().await;
        let removed = guard.remove(conn_id);
        (removed, guard.len())
    };

    match removed {
        Some((user_id, _)) => {
            info!(conn_id = %conn_id, user_id = %user_id, remaining, "connection unregistered");
        }
        None => {
            debug!(conn_id = %conn_id, "unregister for unknown connection ignored");
        }
    }
}

async fn handle_broadcast(registry: &SharedRegistry, counters: &HubCounters, envelope: Envelope) {
    // Snapshot of current connections to minimize lock hold time.
    let targets = {
        let guard = registry.read().await;
        guard.all_connections()
    };

    let dropped = fan_out(&targets, &envelope, counters);
    counters.record_broadcast();

    debug!(
        kind = envelope.kind().as_str(),
        targets = targets.len(),
        dropped,
        "broadcast fanned out"
    );
}

/// Enqueue `envelope` on every target; returns how many were dropped.
pub(crate) fn fan_out(targets: &[ConnectionHandle], envelope: &Envelope, counters: &HubCounters) -> usize {
    let mut dropped = 0;
    for conn in targets {
        if let Err(EnqueueError::QueueFull) = conn.enqueue(envelope.clone()) {
            counters.record_dropped();
            dropped += 1;
        }
    }
    dropped
}

async fn shut_down(mut streams: HubStreams, registry: &SharedRegistry, grace: Duration) {
    info!("hub loop shutting down");

    // Registrations that raced with shutdown are refused; dropping the
    // connection releases its transport.
    streams.register_rx.close();
    while let Ok(RegisterRequest { connection, ack }) = streams.register_rx.try_recv() {
        debug!(conn_id = %connection.id(), "refusing registration during shutdown");
        let _ = ack.send(Err(HubError::ShuttingDown));
    }
    streams.broadcast_rx.close();

    while let Ok(conn_id) = streams.unregister_rx.try_recv() {
        handle_unregister(registry, conn_id).await;
    }

    let live = {
        let guard = registry.read().await;
        guard.all_connections()
    };
    info!(connections = live.len(), "forcing connections closed");
    for conn in &live {
        conn.close();
    }

    let drained = timeout(grace, async {
        loop {
            let empty = registry.read().await.is_empty();
            if empty {
                break;
            }
            match streams.unregister_rx.recv().await {
                Some(conn_id) => handle_unregister(registry, conn_id).await,
                None => break,
            }
        }
    })
    .await;

    if drained.is_err() {
        let abandoned = registry.write().await.clear();
        warn!(
            abandoned = abandoned.len(),
            grace = ?grace,
            "shutdown grace elapsed, abandoning connections"
        );
    }

    info!("hub loop stopped");
}

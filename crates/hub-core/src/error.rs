//! Error types for the hub.
//!
//! Transport and decode failures never surface here: they are terminal
//! for the one connection they happen on and are handled (logged) by
//! that connection's pumps. These errors are what callers of the hub
//! API can observe.

use thiserror::Error;

/// Failure of a hub-level operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The hub is shutting down and no longer accepts work.
    #[error("hub is shutting down")]
    ShuttingDown,

    /// The broadcast stream is saturated; the broadcast was not queued.
    #[error("broadcast queue is full")]
    BroadcastQueueFull,

    /// The coordinating loop has exited.
    #[error("hub loop is not running")]
    LoopClosed,
}

/// Why a single enqueue attempt did not reach a connection's queue.
///
/// Neither case is terminal for the caller; delivery is best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Outbound queue at capacity (slow consumer); the envelope was dropped.
    #[error("outbound queue full")]
    QueueFull,

    /// The connection's write pump is gone.
    #[error("connection closed")]
    Closed,
}

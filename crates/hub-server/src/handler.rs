//! Hook for the application side of the hub.
//!
//! Everything a peer sends that is not a keepalive or a close is handed
//! to a [`MessageHandler`]. The hub does not interpret payloads.

use hub_core::Envelope;
use tracing::info;

use crate::connection::ConnectionHandle;

/// Receives application envelopes from connections.
///
/// Called from the sending connection's read pump, so implementations
/// must not block: hand heavy work to another task. The envelope's
/// `userID` has already been set to the connection's owner.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_envelope(&self, from: &ConnectionHandle, envelope: Envelope);
}

impl<F> MessageHandler for F
where
    F: Fn(&ConnectionHandle, Envelope) + Send + Sync + 'static,
{
    fn on_envelope(&self, from: &ConnectionHandle, envelope: Envelope) {
        self(from, envelope)
    }
}

/// Handler that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn on_envelope(&self, from: &ConnectionHandle, envelope: Envelope) {
        info!(
            conn_id = %from.id(),
            user_id = %from.user_id(),
            kind = envelope.kind().as_str(),
            correlation_id = envelope.id().unwrap_or(""),
            "inbound envelope"
        );
    }
}

//! hub-core
//!
//! Pure connection-hub logic:
//! - identifiers (connections, users)
//! - envelopes (the logical unit of exchanged data)
//! - the two-index connection registry
//! - stats snapshots and error types

pub mod ids;
pub mod envelope;
pub mod registry;
pub mod stats;
pub mod error;

pub use ids::{ConnectionId, UserId};

pub use envelope::{Envelope, EnvelopeKind};

pub use registry::Registry;
pub use stats::HubStats;
pub use error::{EnqueueError, HubError};

//! Envelope types exchanged between the hub and its peers.
//!
//! These are **transport-agnostic** logical messages. Encoding to
//! bytes lives in the `hub-protocol` crate; this module is purely
//! logical.
//!
//! An [`Envelope`] is immutable once built: construct it with one of
//! the constructors, chain the `with_*` builders, then share it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::UserId;

/// Wire tags for the kinds the hub itself understands.
pub const KIND_WELCOME: &str = "welcome";
pub const KIND_PING: &str = "ping";
pub const KIND_PONG: &str = "pong";
pub const KIND_CLOSE: &str = "close";
pub const KIND_NOTICE: &str = "notice";

/// What an envelope is for.
///
/// The hub handles the keepalive and lifecycle kinds itself. Anything
/// else is carried as [`EnvelopeKind::Application`] and forwarded to the
/// message handler without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EnvelopeKind {
    /// Sent once to a connection right after registration.
    Welcome,

    /// Keepalive probe; answered with `Pong`.
    Ping,

    /// Keepalive answer.
    Pong,

    /// Orderly close of the connection.
    Close,

    /// Server-originated notice (maintenance, kicks, ...).
    Notice,

    /// Application-defined kind, forwarded opaquely.
    Application(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Welcome => KIND_WELCOME,
            EnvelopeKind::Ping => KIND_PING,
            EnvelopeKind::Pong => KIND_PONG,
            EnvelopeKind::Close => KIND_CLOSE,
            EnvelopeKind::Notice => KIND_NOTICE,
            EnvelopeKind::Application(kind) => kind,
        }
    }

    /// Keepalive kinds are answered by the connection itself.
    pub fn is_keepalive(&self) -> bool {
        matches!(self, EnvelopeKind::Ping | EnvelopeKind::Pong)
    }
}

impl TryFrom<String> for EnvelopeKind {
    type Error = String;

    fn try_from(kind: String) -> Result<Self, Self::Error> {
        let parsed = match kind.as_str() {
            "" => return Err("envelope kind must not be empty".to_string()),
            KIND_WELCOME => EnvelopeKind::Welcome,
            KIND_PING => EnvelopeKind::Ping,
            KIND_PONG => EnvelopeKind::Pong,
            KIND_CLOSE => EnvelopeKind::Close,
            KIND_NOTICE => EnvelopeKind::Notice,
            _ => EnvelopeKind::Application(kind),
        };
        Ok(parsed)
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Application(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    kind: EnvelopeKind,

    /// Correlation id, echoed back by request/response style handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    /// Sending user (inbound) or target user (outbound).
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,

    #[serde(default)]
    payload: Value,

    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl Envelope {
    /// New envelope of the given kind, stamped now, with a null payload.
    pub fn new(kind: EnvelopeKind) -> Self {
        Envelope {
            kind,
            id: None,
            user_id: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Application envelope carrying an opaque payload.
    pub fn application(kind: impl Into<String>, payload: Value) -> Self {
        let kind = match EnvelopeKind::try_from(kind.into()) {
            Ok(kind) => kind,
            Err(_) => EnvelopeKind::Application("message".to_string()),
        };
        Envelope::new(kind).with_payload(payload)
    }

    pub fn welcome(user_id: UserId, payload: Value) -> Self {
        Envelope::new(EnvelopeKind::Welcome)
            .with_user(user_id)
            .with_payload(payload)
    }

    pub fn ping() -> Self {
        Envelope::new(EnvelopeKind::Ping)
    }

    /// Answer to a ping, carrying the ping's correlation id if any.
    pub fn pong_for(ping: &Envelope) -> Self {
        let pong = Envelope::new(EnvelopeKind::Pong);
        match ping.id() {
            Some(id) => pong.with_id(id),
            None => pong,
        }
    }

    pub fn close(reason: &str) -> Self {
        Envelope::new(EnvelopeKind::Close).with_payload(Value::String(reason.to_string()))
    }

    pub fn notice(text: &str) -> Self {
        Envelope::new(EnvelopeKind::Notice).with_payload(Value::String(text.to_string()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> &EnvelopeKind {
        &self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

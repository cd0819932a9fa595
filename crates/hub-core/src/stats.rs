//! Observability snapshot of a hub.
//!
//! Used for health/status reporting only; nothing in the hub makes
//! control decisions from these numbers.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::ids::UserId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub per_user_connection_counts: BTreeMap<UserId, usize>,
}

impl HubStats {
    /// Connection count for one user, 0 if not connected.
    pub fn connections_for(&self, user_id: &UserId) -> usize {
        self.per_user_connection_counts
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}

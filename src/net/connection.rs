//! Connection identity.
//!
//! Every socket gets a process-unique [`ConnectionId`] at creation. The id is
//! the key under which servers track their connection set and agents track
//! their active/free partitions, and it is attached to every log line about
//! the socket.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::next();
        let id2 = ConnectionId::next();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn connection_id_display() {
        let id = ConnectionId::next();
        assert_eq!(id.to_string(), format!("sock-{}", id.as_u64()));
    }
}

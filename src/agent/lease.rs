//! Exclusive use of a pooled socket.

use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use crate::agent::key::AgentKey;
use crate::agent::pool::PoolShared;
use crate::net::{Socket, SocketEvents};

pub(crate) struct LeaseParts {
    pub key: AgentKey,
    pub socket: Socket,
    pub events: SocketEvents,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// A socket in the agent's active partition.
///
/// Hand it back with [`Agent::release`](crate::agent::Agent::release). A
/// lease dropped without being released is removed from the pool and its
/// socket destroyed.
pub struct Lease {
    parts: Option<LeaseParts>,
    reused: bool,
    pool: Arc<PoolShared>,
}

impl Lease {
    pub(crate) fn new(parts: LeaseParts, reused: bool, pool: Arc<PoolShared>) -> Self {
        Self {
            parts: Some(parts),
            reused,
            pool,
        }
    }

    pub fn key(&self) -> &AgentKey {
        &self.parts().key
    }

    pub fn socket(&self) -> &Socket {
        &self.parts().socket
    }

    /// The socket's notification stream, owned by the lease holder.
    pub fn events(&mut self) -> &mut SocketEvents {
        &mut self.parts_mut().events
    }

    /// Whether the socket came from the free partition.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    pub(crate) fn into_parts(mut self) -> Option<LeaseParts> {
        self.parts.take()
    }

    fn parts(&self) -> &LeaseParts {
        match &self.parts {
            Some(parts) => parts,
            None => unreachable!("lease parts are only taken when the lease is consumed"),
        }
    }

    fn parts_mut(&mut self) -> &mut LeaseParts {
        match &mut self.parts {
            Some(parts) => parts,
            None => unreachable!("lease parts are only taken when the lease is consumed"),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            self.pool.discard(parts);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Lease");
        if let Some(parts) = &self.parts {
            s.field("key", &parts.key).field("socket", &parts.socket);
        }
        s.field("reused", &self.reused).finish()
    }
}

//! Replication error taxonomy.
//!
//! Everything here is local to one (entity, connection) pair and recoverable.
//! Stale packets are not errors; they show up as `applied == false`.

use thiserror::Error;

use crate::entity::{EntityTypeId, NetworkEntityId};
use crate::net::ConnectionId;
use crate::role::{NetworkRole, RpcDirection};

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// An instance tried to queue or invoke an RPC its role does not allow.
    #[error("role violation on {entity:?}: {role} may not {action} {direction:?}")]
    RoleViolation {
        entity: NetworkEntityId,
        direction: RpcDirection,
        role: NetworkRole,
        action: RpcAction,
    },

    /// Malformed payload. The whole packet is discarded.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// Update for an entity the peer holds no subscriber for.
    #[error("no subscriber for {entity:?} on {connection:?}")]
    SubscriberNotFound {
        entity: NetworkEntityId,
        connection: ConnectionId,
    },

    /// A peer sent replication data it is not trusted to send.
    #[error("untrusted update for {entity:?} from {connection:?}")]
    UntrustedUpdate {
        entity: NetworkEntityId,
        connection: ConnectionId,
    },

    #[error("unknown entity {0:?}")]
    EntityNotFound(NetworkEntityId),

    #[error("unknown connection {0:?}")]
    ConnectionNotFound(ConnectionId),

    #[error("no handler for rpc '{name}' on entity type {entity_type:?}")]
    HandlerNotFound {
        entity_type: EntityTypeId,
        name: String,
    },

    #[error("rpc '{name}' failed: {source}")]
    HandlerFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("rpc queue for {connection:?} is full ({limit} pending)")]
    RpcQueueFull {
        connection: ConnectionId,
        limit: usize,
    },
}

impl ReplicationError {
    /// Whether the transport should consider dropping the offending peer.
    pub fn flags_disconnect(&self) -> bool {
        matches!(
            self,
            ReplicationError::SerializationFailure(_)
                | ReplicationError::UntrustedUpdate { .. }
                | ReplicationError::RoleViolation { .. }
        )
    }
}

/// Which side of the direction table was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcAction {
    Queue,
    Invoke,
    /// The remote sender lacked the role for the direction.
    Send,
}

impl std::fmt::Display for RpcAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcAction::Queue => f.write_str("queue"),
            RpcAction::Invoke => f.write_str("invoke"),
            RpcAction::Send => f.write_str("send"),
        }
    }
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;

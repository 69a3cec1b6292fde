//! Network roles and RPC directions.
//!
//! Every replicated entity instance has exactly one [`NetworkRole`]. Which
//! instance may send or receive an RPC is decided by a static table keyed by
//! [`RpcDirection`], checked when an RPC is queued and again when it is
//! invoked.

use serde::{Deserialize, Serialize};

/// Role of one entity instance on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum NetworkRole {
    #[default]
    Invalid,
    /// Owns ground truth and runs the simulation.
    Authority,
    /// Non-authoritative copy on a trusted peer host.
    Server,
    /// Client copy that locally controls the entity.
    Autonomous,
    /// Client copy that only observes.
    Client,
}

impl NetworkRole {
    pub fn mask(self) -> RoleMask {
        match self {
            NetworkRole::Invalid => RoleMask::empty(),
            NetworkRole::Authority => RoleMask::AUTHORITY,
            NetworkRole::Server => RoleMask::SERVER,
            NetworkRole::Autonomous => RoleMask::AUTONOMOUS,
            NetworkRole::Client => RoleMask::CLIENT,
        }
    }

    /// Roles that run controller logic locally.
    pub fn has_controller(self) -> bool {
        matches!(self, NetworkRole::Authority | NetworkRole::Autonomous)
    }
}

impl std::fmt::Display for NetworkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkRole::Invalid => "Invalid",
            NetworkRole::Authority => "Authority",
            NetworkRole::Server => "Server",
            NetworkRole::Autonomous => "Autonomous",
            NetworkRole::Client => "Client",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    /// Set of roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RoleMask: u8 {
        const AUTHORITY = 1 << 0;
        const SERVER = 1 << 1;
        const AUTONOMOUS = 1 << 2;
        const CLIENT = 1 << 3;
    }
}

impl RoleMask {
    pub fn allows(self, role: NetworkRole) -> bool {
        self.intersects(role.mask())
    }
}

/// Who sends an RPC to whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcDirection {
    ServerToAuthority,
    AuthorityToClient,
    AuthorityToAutonomous,
    AutonomousToAuthority,
}

/// One row of the direction table.
#[derive(Debug, Clone, Copy)]
pub struct DirectionRule {
    pub direction: RpcDirection,
    pub sender: NetworkRole,
    pub receivers: RoleMask,
}

/// Direction table. `AuthorityToClient` reaches every client-side copy,
/// including the controlling one.
pub const DIRECTION_RULES: [DirectionRule; 4] = [
    DirectionRule {
        direction: RpcDirection::ServerToAuthority,
        sender: NetworkRole::Server,
        receivers: RoleMask::AUTHORITY,
    },
    DirectionRule {
        direction: RpcDirection::AuthorityToClient,
        sender: NetworkRole::Authority,
        receivers: RoleMask::CLIENT.union(RoleMask::AUTONOMOUS),
    },
    DirectionRule {
        direction: RpcDirection::AuthorityToAutonomous,
        sender: NetworkRole::Authority,
        receivers: RoleMask::AUTONOMOUS,
    },
    DirectionRule {
        direction: RpcDirection::AutonomousToAuthority,
        sender: NetworkRole::Autonomous,
        receivers: RoleMask::AUTHORITY,
    },
];

impl RpcDirection {
    pub fn rule(self) -> &'static DirectionRule {
        // The table is total over the enum.
        match self {
            RpcDirection::ServerToAuthority => &DIRECTION_RULES[0],
            RpcDirection::AuthorityToClient => &DIRECTION_RULES[1],
            RpcDirection::AuthorityToAutonomous => &DIRECTION_RULES[2],
            RpcDirection::AutonomousToAuthority => &DIRECTION_RULES[3],
        }
    }

    pub fn sender_role(self) -> NetworkRole {
        self.rule().sender
    }

    pub fn receiver_roles(self) -> RoleMask {
        self.rule().receivers
    }

    pub fn can_send(self, role: NetworkRole) -> bool {
        self.sender_role() == role
    }

    pub fn can_receive(self, role: NetworkRole) -> bool {
        self.receiver_roles().allows(role)
    }

    /// True for directions that travel towards the Authority instance.
    pub fn targets_authority(self) -> bool {
        matches!(
            self,
            RpcDirection::ServerToAuthority | RpcDirection::AutonomousToAuthority
        )
    }
}

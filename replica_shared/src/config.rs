//! Configuration system.
//!
//! Loads replication configuration from JSON strings (file IO left to app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for one replication world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Listen address for transports that bind one, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed tick period.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Grace period a deleting subscriber (or an orphaned RPC) is kept for.
    #[serde(default = "default_resend_timeout_ms")]
    pub resend_timeout_ms: u64,
    /// Budget for replication records in one outbound packet.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Pending RPC limit per connection.
    #[serde(default = "default_max_queued_rpcs")]
    pub max_queued_rpcs_per_connection: usize,
    /// Goes into the high bits of every entity id this world spawns. Worlds
    /// that publish to each other need distinct values.
    #[serde(default)]
    pub host_id: u16,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_ms() -> u64 {
    50
}

fn default_resend_timeout_ms() -> u64 {
    500
}

fn default_max_payload_bytes() -> usize {
    16 * 1024
}

fn default_max_queued_rpcs() -> usize {
    256
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_ms: default_tick_ms(),
            resend_timeout_ms: default_resend_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            max_queued_rpcs_per_connection: default_max_queued_rpcs(),
            host_id: 0,
        }
    }
}

impl ReplicationConfig {
    /// Parses config from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

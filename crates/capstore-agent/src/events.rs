//! Operator-visible shard events, published on a broadcast channel.

use capstore_core::{CapacitySnapshot, ShardRole};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShardEvent {
    /// A probe succeeded and the registry recorded fresh usage.
    CapacityObserved {
        shard_id: String,
        capacity: CapacitySnapshot,
    },

    /// A shard exceeded the consecutive probe failure limit.
    ShardUnreachable {
        shard_id: String,
        consecutive_failures: u32,
    },

    /// An `UNREACHABLE` shard answered a probe again.
    ShardRecovered { shard_id: String, role: ShardRole },

    /// The write target moved from below to at/above the high-water mark.
    HighWaterMarkCrossed {
        shard_id: String,
        percent_used: f64,
    },

    /// The registry has no write target; provisioning was requested.
    WriteTargetLost { shard_id: Option<String> },

    ProvisioningStarted { shard_id: String, attempt: u32 },

    ProvisioningCompleted {
        shard_id: String,
        demoted: Option<String>,
        version: u64,
        duration_ms: u64,
    },

    ProvisioningFailed { attempts: u32, reason: String },
}

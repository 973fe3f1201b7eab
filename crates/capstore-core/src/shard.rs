//! Shard Descriptor Types
//!
//! A shard is one physical backing store holding a disjoint subset of applicant
//! records. The registry tracks every shard ever provisioned with a
//! [`ShardDescriptor`]; descriptors are appended, never removed.
//!
//! ## Roles
//!
//! | Role | Reads | Writes | Meaning |
//! |------|-------|--------|---------|
//! | `WRITE_TARGET` | yes | yes | The single shard receiving new records |
//! | `READ_ONLY` | yes | no | A former write target, still holds its rows |
//! | `PROVISIONING` | no | no | Registered but not yet serving |
//! | `UNREACHABLE` | no | no | Failed consecutive probes; kept for read completeness |
//!
//! ## Persisted layout
//!
//! Descriptors serialize with camelCase keys so the registry snapshot matches
//! `{version, shards: [{id, role, capacity, connectionInfo}]}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a shard in the current registry version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardRole {
    WriteTarget,
    ReadOnly,
    Provisioning,
    Unreachable,
}

impl ShardRole {
    /// Whether read fan-out should include a shard with this role.
    pub fn is_readable(&self) -> bool {
        matches!(self, ShardRole::WriteTarget | ShardRole::ReadOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardRole::WriteTarget => "WRITE_TARGET",
            ShardRole::ReadOnly => "READ_ONLY",
            ShardRole::Provisioning => "PROVISIONING",
            ShardRole::Unreachable => "UNREACHABLE",
        }
    }
}

impl fmt::Display for ShardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WRITE_TARGET" => Ok(ShardRole::WriteTarget),
            "READ_ONLY" => Ok(ShardRole::ReadOnly),
            "PROVISIONING" => Ok(ShardRole::Provisioning),
            "UNREACHABLE" => Ok(ShardRole::Unreachable),
            other => Err(format!("unknown shard role: {}", other)),
        }
    }
}

/// Opaque handle sufficient to open a session against a backing store.
///
/// Only the allocator that produced it interprets the contents
/// (e.g. `sqlite:///var/lib/capstore/shard-0002.db` or `memory://shard-0002`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionInfo(String);

impl ConnectionInfo {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last observed storage usage of a shard.
///
/// Always a snapshot taken at `observed_at` (ms since epoch), never a live value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub percent_used: f64,
    pub observed_at: i64,
}

impl CapacitySnapshot {
    /// Build a snapshot from raw byte counts. A zero quota reports 0%.
    pub fn from_usage(used_bytes: u64, total_bytes: u64, observed_at: i64) -> Self {
        let percent_used = if total_bytes > 0 {
            (used_bytes as f64 / total_bytes as f64) * 100.0
        } else {
            0.0
        };
        Self {
            used_bytes,
            total_bytes,
            percent_used,
            observed_at,
        }
    }

    /// Snapshot for a shard that has never been probed.
    pub fn unknown() -> Self {
        Self {
            used_bytes: 0,
            total_bytes: 0,
            percent_used: 0.0,
            observed_at: 0,
        }
    }

    /// Compare against a mark in integer arithmetic, so usage exactly at the
    /// mark always counts. The mark is resolved to hundredths of a percent.
    pub fn is_at_or_above(&self, high_water_mark_percent: f64) -> bool {
        if self.total_bytes == 0 {
            return high_water_mark_percent <= 0.0;
        }
        let mark_hundredths = (high_water_mark_percent * 100.0).round().max(0.0) as u128;
        u128::from(self.used_bytes) * 10_000 >= mark_hundredths * u128::from(self.total_bytes)
    }
}

/// One entry of the shard registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardDescriptor {
    /// Unique id assigned at provisioning time, never reused.
    pub id: String,
    pub role: ShardRole,
    pub capacity: CapacitySnapshot,
    pub connection_info: ConnectionInfo,
}

impl ShardDescriptor {
    pub fn new(id: impl Into<String>, connection_info: ConnectionInfo, role: ShardRole) -> Self {
        Self {
            id: id.into(),
            role,
            capacity: CapacitySnapshot::unknown(),
            connection_info,
        }
    }

    pub fn with_capacity(mut self, capacity: CapacitySnapshot) -> Self {
        self.capacity = capacity;
        self
    }
}

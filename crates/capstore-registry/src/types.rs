//! Registry state, events and log entries
//!
//! The registry is an event-sourced state machine. Every committed version is a
//! [`LogEntry`] holding the [`RegistryEvent`]s of one mutation; the current
//! [`RegistrySnapshot`] is the result of applying every entry in order.
//!
//! ```text
//! v1  Bootstrapped   { shard-0001 WRITE_TARGET }
//! v2  CapacityObserved { shard-0001 91% }
//! v3  ShardAppended  { shard-0002 WRITE_TARGET, demoted: shard-0001 }
//! ```
//!
//! [`RegistrySnapshot::apply`] is the only place state changes, for live
//! mutations and for replay alike.

use crate::error::{RegistryError, Result};
use capstore_core::{CapacitySnapshot, ShardDescriptor, ShardRole};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Immutable view of one registry version.
///
/// Serializes to the persisted layout `{version, shards: [{id, role, capacity, connectionInfo}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub version: u64,
    pub shards: Vec<ShardDescriptor>,
}

impl RegistrySnapshot {
    /// State before version 1.
    pub fn empty() -> Self {
        Self {
            version: 0,
            shards: Vec::new(),
        }
    }

    pub fn write_target(&self) -> Option<&ShardDescriptor> {
        self.shards
            .iter()
            .find(|s| s.role == ShardRole::WriteTarget)
    }

    pub fn get(&self, shard_id: &str) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| s.id == shard_id)
    }

    /// Shards serving reads (`WRITE_TARGET` and `READ_ONLY`), oldest first.
    pub fn readable_shards(&self) -> impl Iterator<Item = &ShardDescriptor> {
        self.shards.iter().filter(|s| s.role.is_readable())
    }

    /// The most recently inserted shard that is not `UNREACHABLE`.
    pub fn newest_reachable(&self) -> Option<&ShardDescriptor> {
        self.shards
            .iter()
            .rev()
            .find(|s| s.role != ShardRole::Unreachable)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Next unused `shard-NNNN` id.
    pub fn next_shard_id(&self) -> String {
        let mut n = self.shards.len() + 1;
        loop {
            let id = format!("shard-{:04}", n);
            if self.get(&id).is_none() {
                return id;
            }
            n += 1;
        }
    }

    /// Apply one event in place. Does not touch `version`.
    pub fn apply(&mut self, event: &RegistryEvent) -> Result<()> {
        match event {
            RegistryEvent::Bootstrapped { shard } => {
                if !self.shards.is_empty() {
                    return Err(RegistryError::InvariantViolation(
                        "bootstrap on a non-empty registry".to_string(),
                    ));
                }
                self.shards.push(shard.clone());
            }
            RegistryEvent::ShardAppended { shard, demoted } => {
                if self.get(&shard.id).is_some() {
                    return Err(RegistryError::InvariantViolation(format!(
                        "shard id {} already registered",
                        shard.id
                    )));
                }
                if let Some(old) = demoted {
                    let old = self.get_mut(old)?;
                    if old.role != ShardRole::WriteTarget {
                        return Err(RegistryError::InvariantViolation(format!(
                            "demoted shard {} is {}, not WRITE_TARGET",
                            old.id, old.role
                        )));
                    }
                    old.role = ShardRole::ReadOnly;
                }
                self.shards.push(shard.clone());
            }
            RegistryEvent::RoleChanged { shard_id, from, to } => {
                let shard = self.get_mut(shard_id)?;
                if shard.role != *from {
                    return Err(RegistryError::InvariantViolation(format!(
                        "shard {} is {}, event expected {}",
                        shard_id, shard.role, from
                    )));
                }
                shard.role = *to;
            }
            RegistryEvent::CapacityObserved { shard_id, capacity } => {
                self.get_mut(shard_id)?.capacity = *capacity;
            }
        }
        Ok(())
    }

    /// Check the structural invariants every committed version must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(RegistryError::InvariantViolation(
                "registry has no shards".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id.as_str()) {
                return Err(RegistryError::InvariantViolation(format!(
                    "duplicate shard id {}",
                    shard.id
                )));
            }
        }

        let targets: Vec<_> = self
            .shards
            .iter()
            .filter(|s| s.role == ShardRole::WriteTarget)
            .collect();
        match targets.as_slice() {
            [] => Ok(()),
            [target] => {
                let newest = self.newest_reachable().map(|s| s.id.as_str());
                if newest == Some(target.id.as_str()) {
                    Ok(())
                } else {
                    Err(RegistryError::InvariantViolation(format!(
                        "write target {} is not the newest reachable shard",
                        target.id
                    )))
                }
            }
            many => Err(RegistryError::InvariantViolation(format!(
                "{} shards hold WRITE_TARGET",
                many.len()
            ))),
        }
    }

    fn get_mut(&mut self, shard_id: &str) -> Result<&mut ShardDescriptor> {
        self.shards
            .iter_mut()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| RegistryError::UnknownShard(shard_id.to_string()))
    }
}

/// One state transition recorded in the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// First shard of a fresh registry.
    Bootstrapped { shard: ShardDescriptor },

    /// New shard appended; `demoted` names the previous write target, which
    /// becomes `READ_ONLY` in the same version.
    ShardAppended {
        shard: ShardDescriptor,
        demoted: Option<String>,
    },

    RoleChanged {
        shard_id: String,
        from: ShardRole,
        to: ShardRole,
    },

    CapacityObserved {
        shard_id: String,
        capacity: CapacitySnapshot,
    },
}

/// A committed registry version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: u64,
    pub events: Vec<RegistryEvent>,
    pub committed_at: i64,
}

/// Rebuild the registry by applying log entries from version 1.
pub fn replay<'a, I>(entries: I) -> Result<RegistrySnapshot>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut state = RegistrySnapshot::empty();
    for entry in entries {
        if entry.version != state.version + 1 {
            return Err(RegistryError::ReplayMismatch(format!(
                "log gap: expected version {}, found {}",
                state.version + 1,
                entry.version
            )));
        }
        for event in &entry.events {
            state.apply(event)?;
        }
        state.validate()?;
        state.version = entry.version;
    }
    Ok(state)
}

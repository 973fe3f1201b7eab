//! capstore core types
//!
//! Shared vocabulary for every capstore crate:
//!
//! - **Shards**: [`ShardDescriptor`], [`ShardRole`], [`CapacitySnapshot`] and the
//!   opaque [`ConnectionInfo`] handle used to reach a backing store.
//! - **Records**: [`ApplicantRecord`], the logical row stored on exactly one shard,
//!   and [`RecordQuery`], the filter language fanned out across shards.
//! - **Configuration**: [`CapstoreConfig`] and its per-component sections.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ threshold ┌──────────────┐  append   ┌──────────────┐
//! │   Capacity   │ ────────► │    Shard     │ ────────► │    Shard     │
//! │   Monitor    │           │  Provisioner │           │   Registry   │
//! └──────────────┘           └──────────────┘           └──────┬───────┘
//!                                                              │ snapshot
//!                                                       ┌──────▼───────┐
//!                                           callers ──► │ Query Router │
//!                                                       └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod record;
pub mod shard;

pub use config::{CapstoreConfig, MonitorConfig, ProvisionerConfig, RegistryConfig, RouterConfig};
pub use error::{ConfigError, Result};
pub use record::{
    format_candidate_id, parse_candidate_sequence, ApplicantRecord, RecordQuery,
    CANDIDATE_ID_PREFIX,
};
pub use shard::{CapacitySnapshot, ConnectionInfo, ShardDescriptor, ShardRole};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

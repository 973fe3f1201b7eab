//! capstore Agent
//!
//! Background machinery that keeps the shard set ahead of storage growth:
//!
//! - [`CapacityMonitor`]: polls every shard's usage, escalates dead shards to
//!   `UNREACHABLE`, and raises exactly one provisioning request per
//!   high-water-mark crossing of the write target.
//! - [`ShardProvisioner`]: allocates a new store, applies the canonical schema,
//!   and promotes it to write target in one registry version.
//! - [`ShardCoordinator`]: starts and stops both as tokio tasks and exposes
//!   operator triggers.
//!
//! ## Example
//!
//! ```ignore
//! let coordinator = ShardCoordinator::new(registry, allocator, &config);
//! let mut events = coordinator.subscribe();
//! coordinator.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     tracing::info!(?event, "shard event");
//! }
//!
//! coordinator.stop().await?;
//! ```

pub mod coordinator;
pub mod error;
pub mod events;
pub mod monitor;
pub mod provisioner;

pub use coordinator::ShardCoordinator;
pub use error::{AgentError, Result};
pub use events::ShardEvent;
pub use monitor::{CapacityMonitor, RefreshReport};
pub use provisioner::{ProvisionOutcome, ProvisionRequest, ProvisionTrigger, ShardProvisioner};

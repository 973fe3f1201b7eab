//! capstore Query Router
//!
//! The only caller-facing surface of the sharded store. Writes go to the
//! current write target, reads fan out to every readable shard, and partial
//! results are always explicit.
//!
//! ```ignore
//! let router = QueryRouter::new(registry, allocator, config.router.clone());
//!
//! let id = router.next_candidate_id().await?;
//! router.write(&ApplicantRecord::new(id, "Ada Lovelace", now_ms())).await?;
//!
//! let result = router.read(&RecordQuery::ByEmail("ada@example.com".into())).await;
//! if result.partial {
//!     tracing::warn!(unreachable = ?result.unreachable_shards, "Partial result");
//! }
//! ```

pub mod error;
pub mod retry;
pub mod router;

pub use error::{Result, RouterError};
pub use retry::RetryPolicy;
pub use router::{QueryRouter, ReadResult, RoutedRecord, WriteReceipt};

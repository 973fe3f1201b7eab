//! Agent Error Types
//!
//! - `ProbeFailure` / `ProbeTimeout`: one shard's usage probe failed. Transient;
//!   the monitor counts consecutive failures and escalates to `UNREACHABLE`.
//! - `ProvisioningFailure`: every provisioning attempt failed. Operator-visible,
//!   never affects the current write target.
//! - `ProvisioningInProgress`: a second provisioning was requested while one runs.

use capstore_backend::BackendError;
use capstore_registry::RegistryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Probe of shard {shard_id} failed: {message}")]
    ProbeFailure { shard_id: String, message: String },

    #[error("Probe of shard {shard_id} timed out after {timeout_ms}ms")]
    ProbeTimeout { shard_id: String, timeout_ms: u64 },

    #[error("Provisioning failed after {attempts} attempt(s): {message}")]
    ProvisioningFailure { attempts: u32, message: String },

    #[error("Provisioning already in progress")]
    ProvisioningInProgress,

    #[error("Coordinator already running")]
    AlreadyRunning,

    #[error("Coordinator not running")]
    NotRunning,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

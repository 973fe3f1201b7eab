//! Canonical shard schema
//!
//! Every shard carries the same `candidates` table plus a small `capstore_meta`
//! key/value table recording the applied schema version and the shard quota.

/// Version written to `capstore_meta` once the schema is applied.
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const META_QUOTA_BYTES: &str = "quota_bytes";

pub(crate) const CREATE_META_TABLE: &str = "
CREATE TABLE IF NOT EXISTS capstore_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

pub(crate) const CREATE_CANDIDATES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS candidates (
    candidate_id TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    email        TEXT,
    phone        TEXT,
    form_data    TEXT NOT NULL DEFAULT '{}',
    resume_link  TEXT,
    created_by   TEXT,
    can_edit     INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
)";

pub(crate) const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_candidates_email ON candidates (email COLLATE NOCASE)",
    "CREATE INDEX IF NOT EXISTS idx_candidates_created_by ON candidates (created_by)",
    "CREATE INDEX IF NOT EXISTS idx_candidates_created_at ON candidates (created_at)",
];

pub(crate) const SELECT_COLUMNS: &str = "candidate_id, name, email, phone, form_data, \
     resume_link, created_by, can_edit, created_at, updated_at";

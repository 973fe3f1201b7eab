//! SQLite Shard Backend
//!
//! Each shard is one SQLite file under the allocator's data directory:
//!
//! ```text
//! data/shards/
//! ├── shard-0001.db
//! ├── shard-0002.db
//! └── shard-0003.db
//! ```
//!
//! ## Quota enforcement
//!
//! A shard's quota is recorded in `capstore_meta` when the file is allocated.
//! Every pooled connection sets `PRAGMA max_page_count` to `quota / page_size`,
//! so SQLite itself rejects writes past the quota with `SQLITE_FULL`, which is
//! surfaced as [`BackendError::StorageFull`].
//!
//! ## Usage probe
//!
//! Used bytes are `(page_count - freelist_count) * page_size`; the total is the
//! recorded quota.

use crate::error::{is_unique_violation, BackendError, Result};
use crate::schema::{
    CREATE_CANDIDATES_TABLE, CREATE_INDEXES, CREATE_META_TABLE, META_QUOTA_BYTES,
    META_SCHEMA_VERSION, SCHEMA_VERSION, SELECT_COLUMNS,
};
use crate::{ShardAllocator, ShardBackend, StorageUsage};
use async_trait::async_trait;
use capstore_core::{ApplicantRecord, ConnectionInfo, RecordQuery};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Connection, Row};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const SCHEME: &str = "sqlite://";

/// Allocates one SQLite file per shard.
pub struct SqliteAllocator {
    data_dir: PathBuf,
    quota_bytes: u64,
    max_connections: u32,
}

impl SqliteAllocator {
    pub fn new(data_dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            quota_bytes,
            max_connections: 4,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path_for(&self, shard_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", shard_id))
    }

    fn parse_path(info: &ConnectionInfo) -> Result<PathBuf> {
        info.as_str()
            .strip_prefix(SCHEME)
            .map(PathBuf::from)
            .ok_or_else(|| BackendError::InvalidConnection(info.to_string()))
    }
}

#[async_trait]
impl ShardAllocator for SqliteAllocator {
    async fn allocate(&self, shard_id: &str) -> Result<ConnectionInfo> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        let path = self.path_for(shard_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(BackendError::AlreadyExists(path.display().to_string()));
        }

        let info = ConnectionInfo::new(format!("{}{}", SCHEME, path.display()));
        let options = SqliteConnectOptions::from_str(info.as_str())?.create_if_missing(true);

        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::query(CREATE_META_TABLE).execute(&mut conn).await?;
        sqlx::query("INSERT INTO capstore_meta (key, value) VALUES (?, ?)")
            .bind(META_QUOTA_BYTES)
            .bind(self.quota_bytes.to_string())
            .execute(&mut conn)
            .await?;
        conn.close().await?;

        tracing::info!(
            shard_id = %shard_id,
            path = %path.display(),
            quota_bytes = self.quota_bytes,
            "Allocated SQLite shard"
        );

        Ok(info)
    }

    async fn open(&self, shard_id: &str, info: &ConnectionInfo) -> Result<Arc<dyn ShardBackend>> {
        let path = Self::parse_path(info)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BackendError::Unavailable(format!(
                "shard file missing: {}",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::from_str(info.as_str())?.create_if_missing(false);

        // Read the recorded quota and page size before sizing the pool.
        let mut conn = SqliteConnection::connect_with(&options).await?;
        let recorded: Option<String> =
            sqlx::query_scalar("SELECT value FROM capstore_meta WHERE key = ?")
                .bind(META_QUOTA_BYTES)
                .fetch_optional(&mut conn)
                .await
                .ok()
                .flatten();
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;

        let quota_bytes = recorded
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(self.quota_bytes);
        let max_pages = (quota_bytes / page_size.max(1) as u64).max(1);

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options.pragma("max_page_count", Cow::Owned(max_pages.to_string())))
            .await?;

        tracing::debug!(shard_id = %shard_id, max_pages, "Opened SQLite shard");

        Ok(Arc::new(SqliteShardBackend {
            shard_id: shard_id.to_string(),
            pool,
            quota_bytes,
        }))
    }

    async fn discard(&self, info: &ConnectionInfo) -> Result<()> {
        let path = Self::parse_path(info)?;
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(path = %path.display(), "Discarded SQLite shard");
        Ok(())
    }
}

/// Session against one SQLite shard file.
pub struct SqliteShardBackend {
    shard_id: String,
    pool: SqlitePool,
    quota_bytes: u64,
}

impl SqliteShardBackend {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    fn row_to_record(row: &SqliteRow) -> Result<ApplicantRecord> {
        let form_data: String = row.try_get("form_data")?;
        Ok(ApplicantRecord {
            candidate_id: row.try_get("candidate_id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            form_data: serde_json::from_str(&form_data)?,
            resume_link: row.try_get("resume_link")?,
            created_by: row.try_get("created_by")?,
            can_edit: row.try_get("can_edit")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ShardBackend for SqliteShardBackend {
    fn shard_id(&self) -> &str {
        &self.shard_id
    }

    async fn apply_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(CREATE_META_TABLE).execute(&mut *tx).await?;
        sqlx::query(CREATE_CANDIDATES_TABLE).execute(&mut *tx).await?;
        for index in CREATE_INDEXES {
            sqlx::query(index).execute(&mut *tx).await?;
        }
        sqlx::query(
            "INSERT INTO capstore_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(META_SCHEMA_VERSION)
        .bind(SCHEMA_VERSION.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<Option<u32>> {
        let value: Option<String> =
            match sqlx::query_scalar("SELECT value FROM capstore_meta WHERE key = ?")
                .bind(META_SCHEMA_VERSION)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(value) => value,
                Err(e) => match BackendError::from(e) {
                    BackendError::Schema(_) => None,
                    other => return Err(other),
                },
            };

        match value {
            Some(v) => v
                .parse::<u32>()
                .map(Some)
                .map_err(|_| BackendError::Schema(format!("unreadable schema version: {}", v))),
            None => Ok(None),
        }
    }

    async fn usage(&self) -> Result<StorageUsage> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let freelist: i64 = sqlx::query_scalar("PRAGMA freelist_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        let used_pages = (page_count - freelist).max(0) as u64;
        Ok(StorageUsage {
            used_bytes: used_pages * page_size.max(0) as u64,
            total_bytes: self.quota_bytes,
        })
    }

    async fn insert(&self, record: &ApplicantRecord) -> Result<()> {
        let form_data = serde_json::to_string(&record.form_data)?;

        let result = sqlx::query(
            "INSERT INTO candidates (candidate_id, name, email, phone, form_data,
                                     resume_link, created_by, can_edit, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.candidate_id)
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.phone)
        .bind(form_data)
        .bind(&record.resume_link)
        .bind(&record.created_by)
        .bind(record.can_edit)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(BackendError::DuplicateKey(record.candidate_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &ApplicantRecord) -> Result<()> {
        let form_data = serde_json::to_string(&record.form_data)?;

        let result = sqlx::query(
            "UPDATE candidates
             SET name = ?, email = ?, phone = ?, form_data = ?, resume_link = ?,
                 created_by = ?, can_edit = ?, updated_at = ?
             WHERE candidate_id = ?",
        )
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.phone)
        .bind(form_data)
        .bind(&record.resume_link)
        .bind(&record.created_by)
        .bind(record.can_edit)
        .bind(record.updated_at)
        .bind(&record.candidate_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(record.candidate_id.clone()));
        }
        Ok(())
    }

    async fn get(&self, candidate_id: &str) -> Result<Option<ApplicantRecord>> {
        let sql = format!(
            "SELECT {} FROM candidates WHERE candidate_id = ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<ApplicantRecord>> {
        let (filter, arg) = match query {
            RecordQuery::All => ("1 = 1", None),
            RecordQuery::ByKey(key) => ("candidate_id = ?", Some(key)),
            RecordQuery::ByEmail(email) => ("email = ? COLLATE NOCASE", Some(email)),
            RecordQuery::NameContains(fragment) => {
                ("instr(lower(name), lower(?)) > 0", Some(fragment))
            }
            RecordQuery::CreatedBy(user) => ("created_by = ?", Some(user)),
        };

        let sql = format!(
            "SELECT {} FROM candidates WHERE {} ORDER BY candidate_id",
            SELECT_COLUMNS, filter
        );
        let mut q = sqlx::query(&sql);
        if let Some(arg) = arg {
            q = q.bind(arg);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn max_key_sequence(&self, prefix: &str) -> Result<Option<u64>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT candidate_id FROM candidates WHERE substr(candidate_id, 1, ?) = ?")
                .bind(prefix.len() as i64)
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;

        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix))
            .filter_map(|digits| digits.parse::<u64>().ok())
            .max())
    }
}

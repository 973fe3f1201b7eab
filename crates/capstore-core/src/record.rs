//! Applicant Records
//!
//! An [`ApplicantRecord`] is addressed by `candidate_id`, which is unique across
//! the entire logical dataset. Once persisted on a shard a record never moves.
//!
//! Uploaded documents are never stored here; `resume_link` is an opaque
//! reference into an external blob store.

use serde::{Deserialize, Serialize};

/// Prefix of generated candidate ids (`CAND-0001`, `CAND-0002`, ...).
pub const CANDIDATE_ID_PREFIX: &str = "CAND-";

/// A logical applicant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantRecord {
    /// Primary key, unique across all shards.
    pub candidate_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Free-form application form answers.
    #[serde(default)]
    pub form_data: serde_json::Value,
    /// Reference URL of the uploaded resume (never fetched).
    pub resume_link: Option<String>,
    pub created_by: Option<String>,
    #[serde(default)]
    pub can_edit: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApplicantRecord {
    /// Create a record with the mandatory fields; timestamps are set to `now`.
    pub fn new(candidate_id: impl Into<String>, name: impl Into<String>, now: i64) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            name: name.into(),
            email: None,
            phone: None,
            form_data: serde_json::Value::Object(serde_json::Map::new()),
            resume_link: None,
            created_by: None,
            can_edit: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.candidate_id
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_resume_link(mut self, link: impl Into<String>) -> Self {
        self.resume_link = Some(link.into());
        self
    }

    pub fn with_created_by(mut self, user: impl Into<String>) -> Self {
        self.created_by = Some(user.into());
        self
    }

    pub fn with_form_data(mut self, form_data: serde_json::Value) -> Self {
        self.form_data = form_data;
        self
    }

    /// Numeric part of a `CAND-NNNN` id, if the id follows that format.
    pub fn key_sequence(&self) -> Option<u64> {
        parse_candidate_sequence(&self.candidate_id)
    }
}

/// Parse the numeric suffix of `CAND-NNNN`.
pub fn parse_candidate_sequence(candidate_id: &str) -> Option<u64> {
    candidate_id
        .strip_prefix(CANDIDATE_ID_PREFIX)
        .and_then(|digits| digits.parse::<u64>().ok())
}

/// Format a candidate id, zero-padded to four digits.
pub fn format_candidate_id(sequence: u64) -> String {
    format!("{}{:04}", CANDIDATE_ID_PREFIX, sequence)
}

/// Filter evaluated independently on every shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordQuery {
    /// Every record.
    All,
    /// Exact primary key match.
    ByKey(String),
    /// Case-insensitive email match.
    ByEmail(String),
    /// Case-insensitive substring of the name.
    NameContains(String),
    /// Records created by a given user.
    CreatedBy(String),
}

impl RecordQuery {
    /// Evaluate the filter against a record (used by non-SQL backends).
    pub fn matches(&self, record: &ApplicantRecord) -> bool {
        match self {
            RecordQuery::All => true,
            RecordQuery::ByKey(key) => record.candidate_id == *key,
            RecordQuery::ByEmail(email) => record
                .email
                .as_deref()
                .map(|e| e.eq_ignore_ascii_case(email))
                .unwrap_or(false),
            RecordQuery::NameContains(fragment) => record
                .name
                .to_lowercase()
                .contains(&fragment.to_lowercase()),
            RecordQuery::CreatedBy(user) => record.created_by.as_deref() == Some(user.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_id_format() {
        assert_eq!(format_candidate_id(1), "CAND-0001");
        assert_eq!(format_candidate_id(12345), "CAND-12345");
        assert_eq!(parse_candidate_sequence("CAND-0042"), Some(42));
        assert_eq!(parse_candidate_sequence("APPL-0042"), None);
        assert_eq!(parse_candidate_sequence("CAND-abc"), None);
    }

    #[test]
    fn test_query_matching() {
        let record = ApplicantRecord::new("CAND-0001", "Ada Lovelace", 0)
            .with_email("Ada@Example.com")
            .with_created_by("receptionist");

        assert!(RecordQuery::All.matches(&record));
        assert!(RecordQuery::ByKey("CAND-0001".into()).matches(&record));
        assert!(!RecordQuery::ByKey("CAND-0002".into()).matches(&record));
        assert!(RecordQuery::ByEmail("ada@example.com".into()).matches(&record));
        assert!(RecordQuery::NameContains("love".into()).matches(&record));
        assert!(RecordQuery::CreatedBy("receptionist".into()).matches(&record));
        assert!(!RecordQuery::CreatedBy("ceo".into()).matches(&record));
    }

    #[test]
    fn test_email_query_without_email() {
        let record = ApplicantRecord::new("CAND-0001", "No Mail", 0);
        assert!(!RecordQuery::ByEmail("x@example.com".into()).matches(&record));
    }
}

//! Core domain model for staysync: regions, rows, natural keys, the entity
//! catalog and the sync-status record produced by every run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod catalog;
mod rules;

pub use catalog::{
    Cast, Catalog, CatalogError, ChildReference, ChildSource, ChildSpec, DirectPass, EntitySpec,
    ExternalId, FieldMapping, ForeignKeyPass, HeuristicPass, KeepIf, Partition, RegionSpec,
    ScopeJoin, SubjectColumns, WindowColumns,
};
pub use rules::{date_from_value, HeuristicCandidate, HeuristicSubject, MatchRule};

pub const CRATE_NAME: &str = "staysync-core";

/// Column carried by every row; the isolation boundary between tenants.
pub const REGION_COLUMN: &str = "region_code";

/// Database-assigned surrogate primary key column.
pub const SURROGATE_COLUMN: &str = "id";

/// One relational row, column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Validated region code (`nashville`, `hilton_head`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegionCode(String);

impl RegionCode {
    pub fn new(code: impl Into<String>) -> Result<Self, CatalogError> {
        let code = code.into();
        if is_identifier(&code) {
            Ok(Self(code))
        } else {
            Err(CatalogError::InvalidRegion(code))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RegionCode {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RegionCode> for String {
    fn from(value: RegionCode) -> Self {
        value.0
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase SQL identifier check used for every table and column name that
/// ends up interpolated into a statement.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    first_ok
        && name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Canonical text of an upstream identifier. Numbers and strings compare equal
/// when they print the same (`123` and `"123"`); blanks are treated as absent.
pub fn external_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Business identity of a table. Never empty: a table cannot be registered,
/// and therefore cannot be upserted, without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    pub fn new<I, S>(columns: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(CatalogError::EmptyNaturalKey);
        }
        for (idx, column) in columns.iter().enumerate() {
            if !is_identifier(column) {
                return Err(CatalogError::InvalidIdentifier {
                    context: "natural key".to_string(),
                    name: column.clone(),
                });
            }
            if columns[..idx].contains(column) {
                return Err(CatalogError::DuplicateName(column.clone()));
            }
        }
        Ok(Self(columns))
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c == column)
    }

    /// Identity tuple of a row, or `None` when any key column is absent or null.
    pub fn key_of(&self, row: &Row) -> Option<Vec<String>> {
        self.0
            .iter()
            .map(|column| row.get(column).and_then(key_text))
            .collect()
    }

    /// Grouping identity where nulls compare equal, as in SQL `PARTITION BY`.
    pub fn identity_of(&self, row: &Row) -> Vec<Option<String>> {
        self.0
            .iter()
            .map(|column| row.get(column).and_then(key_text))
            .collect()
    }

    /// First key column the row does not carry.
    pub fn missing_column<'a>(&'a self, row: &Row) -> Option<&'a str> {
        self.0
            .iter()
            .find(|column| row.get(column.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for NaturalKey {
    type Error = CatalogError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NaturalKey> for Vec<String> {
    fn from(value: NaturalKey) -> Self {
        value.0
    }
}

/// Everything the load side needs to know about one physical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    name: String,
    natural_key: NaturalKey,
    fk_columns: Vec<String>,
    referrers: Vec<Referrer>,
}

/// A column of another table holding this table's surrogate id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referrer {
    pub table: String,
    pub column: String,
    /// Natural key of the referring table; when it includes `column`, moving a
    /// reference can collide with a row already under the new target.
    pub natural_key: NaturalKey,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, natural_key: NaturalKey) -> Result<Self, CatalogError> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(CatalogError::InvalidIdentifier {
                context: "table".to_string(),
                name,
            });
        }
        Ok(Self {
            name,
            natural_key,
            fk_columns: Vec::new(),
            referrers: Vec::new(),
        })
    }

    /// FK columns are written monotonically: an upsert never nulls or changes a
    /// value that is already set.
    pub fn with_fk_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.fk_columns.contains(&column) {
                self.fk_columns.push(column);
            }
        }
        self
    }

    pub fn with_referrers(mut self, referrers: impl IntoIterator<Item = Referrer>) -> Self {
        for referrer in referrers {
            let known = self
                .referrers
                .iter()
                .any(|r| r.table == referrer.table && r.column == referrer.column);
            if !known {
                self.referrers.push(referrer);
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn referrers(&self) -> &[Referrer] {
        &self.referrers
    }

    pub fn natural_key(&self) -> &NaturalKey {
        &self.natural_key
    }

    pub fn fk_columns(&self) -> &[String] {
        &self.fk_columns
    }

    pub fn is_fk_column(&self, column: &str) -> bool {
        self.fk_columns.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Outcome record handed to the sync-status collaborator after each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusRecord {
    pub region: RegionCode,
    pub entity_type: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub fk_resolved_count: u64,
    pub error_message: Option<String>,
}

impl SyncStatusRecord {
    pub fn running(region: RegionCode, entity_type: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            region,
            entity_type: entity_type.into(),
            status: SyncStatus::Running,
            started_at,
            completed_at: None,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            fk_resolved_count: 0,
            error_message: None,
        }
    }

    pub fn succeeded(mut self, completed_at: DateTime<Utc>) -> Self {
        self.status = SyncStatus::Success;
        self.completed_at = Some(completed_at);
        self.error_message = None;
        self
    }

    pub fn failed(mut self, completed_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        self.status = SyncStatus::Failed;
        self.completed_at = Some(completed_at);
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn region_codes_must_be_identifiers() {
        assert!(RegionCode::new("hilton_head").is_ok());
        assert!(RegionCode::new("Hilton Head").is_err());
        assert!(RegionCode::new("").is_err());
    }

    #[test]
    fn natural_key_rejects_empty_and_duplicate_columns() {
        assert!(matches!(
            NaturalKey::new(Vec::<String>::new()),
            Err(CatalogError::EmptyNaturalKey)
        ));
        assert!(NaturalKey::new(["task_pk", "task_pk"]).is_err());
        assert!(NaturalKey::new(["task_pk", "comment_id"]).is_ok());
    }

    #[test]
    fn natural_key_identity_treats_numbers_and_strings_alike() {
        let key = NaturalKey::new(["task_pk", "comment_id"]).unwrap();
        let a = json!({"task_pk": 7, "comment_id": "5"});
        let b = json!({"task_pk": "7", "comment_id": "5", "comment": "hi"});
        let a = a.as_object().unwrap();
        let b = b.as_object().unwrap();
        assert_eq!(key.key_of(a), key.key_of(b));

        let partial = json!({"task_pk": 7, "comment_id": null});
        assert_eq!(key.key_of(partial.as_object().unwrap()), None);
        assert_eq!(key.missing_column(partial.as_object().unwrap()), Some("comment_id"));
    }

    #[test]
    fn external_keys_ignore_blanks() {
        assert_eq!(external_key(&json!(42)), Some("42".to_string()));
        assert_eq!(external_key(&json!(" P1 ")), Some("P1".to_string()));
        assert_eq!(external_key(&json!("")), None);
        assert_eq!(external_key(&json!(null)), None);
    }

    #[test]
    fn status_record_transitions() {
        let started = Utc::now();
        let region = RegionCode::new("austin").unwrap();
        let rec = SyncStatusRecord::running(region, "tasks", started);
        assert_eq!(rec.status, SyncStatus::Running);
        let failed = rec.clone().failed(started, "boom");
        assert_eq!(failed.status.as_str(), "failed");
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        let ok = rec.succeeded(started);
        assert_eq!(ok.status, SyncStatus::Success);
        assert!(ok.completed_at.is_some());
    }
}

//! Change record representation
//!
//! One [`ChangeRecord`] per row-level mutation, immutable once produced.
//! Records carry the journal file and execute timestamp they were read at,
//! plus the GTID pair when GTID tracking is enabled.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row image: column name to value.
pub type RowImage = Map<String, Value>;

/// Kind of row-level mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Insert => write!(f, "INSERT"),
            OperationKind::Update => write!(f, "UPDATE"),
            OperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single row-level mutation decoded from the replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Operation kind
    pub op: OperationKind,
    /// Schema (database) name
    pub schema: String,
    /// Table name
    pub table: String,
    /// Row state before the mutation (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RowImage>,
    /// Row state after the mutation (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<RowImage>,
    /// Journal file the mutation was read from
    pub journal_file: String,
    /// Upstream execute timestamp (epoch millis)
    pub execute_time: i64,
    /// Serialized GTID range as of this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
    /// The single GTID of the enclosing transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_gtid: Option<String>,
}

impl ChangeRecord {
    /// Create an INSERT record.
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        after: RowImage,
        journal_file: impl Into<String>,
        execute_time: i64,
    ) -> Self {
        Self {
            op: OperationKind::Insert,
            schema: schema.into(),
            table: table.into(),
            before: None,
            after: Some(after),
            journal_file: journal_file.into(),
            execute_time,
            gtid: None,
            current_gtid: None,
        }
    }

    /// Create an UPDATE record.
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: Option<RowImage>,
        after: RowImage,
        journal_file: impl Into<String>,
        execute_time: i64,
    ) -> Self {
        Self {
            op: OperationKind::Update,
            schema: schema.into(),
            table: table.into(),
            before,
            after: Some(after),
            journal_file: journal_file.into(),
            execute_time,
            gtid: None,
            current_gtid: None,
        }
    }

    /// Create a DELETE record.
    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: RowImage,
        journal_file: impl Into<String>,
        execute_time: i64,
    ) -> Self {
        Self {
            op: OperationKind::Delete,
            schema: schema.into(),
            table: table.into(),
            before: Some(before),
            after: None,
            journal_file: journal_file.into(),
            execute_time,
            gtid: None,
            current_gtid: None,
        }
    }

    /// Attach the GTID pair.
    pub fn with_gtid(mut self, gtid: impl Into<String>, current: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self.current_gtid = Some(current.into());
        self
    }

    /// Fully-qualified table name (`schema.table`).
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(pairs: &[(&str, Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insert_record() {
        let rec = ChangeRecord::insert(
            "mydb",
            "users",
            image(&[("id", json!(1)), ("name", json!("Alice"))]),
            "mysql-bin.000001",
            1705000000000,
        );
        assert_eq!(rec.op, OperationKind::Insert);
        assert!(rec.before.is_none());
        assert!(rec.after.is_some());
        assert_eq!(rec.qualified_table(), "mydb.users");
    }

    #[test]
    fn test_update_record_carries_both_images() {
        let rec = ChangeRecord::update(
            "mydb",
            "users",
            Some(image(&[("id", json!(1)), ("name", json!("Alice"))])),
            image(&[("id", json!(1)), ("name", json!("Bob"))]),
            "mysql-bin.000001",
            0,
        );
        assert!(rec.before.is_some());
        assert!(rec.after.is_some());
    }

    #[test]
    fn test_delete_record() {
        let rec = ChangeRecord::delete(
            "mydb",
            "users",
            image(&[("id", json!(1))]),
            "mysql-bin.000001",
            0,
        );
        assert!(rec.before.is_some());
        assert!(rec.after.is_none());
    }

    #[test]
    fn test_record_serialization_omits_absent_fields() {
        let rec = ChangeRecord::insert("db", "t", RowImage::new(), "mysql-bin.000001", 0);
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("before"));
        assert!(!json.contains("gtid"));
        assert!(json.contains("\"op\":\"INSERT\""));

        let parsed: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_with_gtid() {
        let rec = ChangeRecord::insert("db", "t", RowImage::new(), "mysql-bin.000001", 0)
            .with_gtid("uuid:1-5", "uuid:5");
        assert_eq!(rec.gtid.as_deref(), Some("uuid:1-5"));
        assert_eq!(rec.current_gtid.as_deref(), Some("uuid:5"));
    }
}

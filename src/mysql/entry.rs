//! Raw replication entry model
//!
//! A fetched unit ([`RawBatch`]) carries the wire entries of one
//! subscription read: transaction markers, row-data entries, and
//! heartbeats. Row payloads stay opaque bytes until the parser decodes
//! them against cached table metadata; row values are positional and carry
//! no column names.

use crate::common::{CdcError, OperationKind, ReplicationPosition, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of replication entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Transaction begin marker
    TransactionBegin,
    /// Row mutation data
    RowData,
    /// Transaction end (commit); its offset is the group key
    TransactionEnd,
    /// Schema change statement; invalidates cached table metadata
    Ddl,
    /// Upstream heartbeat, no data
    Heartbeat,
}

/// Header common to all entry kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Journal (binlog) file this entry was read from
    pub journal_file: String,
    /// Byte offset of the entry within the journal file
    pub offset: u64,
    /// Upstream execute timestamp (epoch millis)
    pub execute_time: i64,
    /// Schema name; empty for non-row entries
    pub schema: String,
    /// Table name; empty for non-row entries
    pub table: String,
    /// Entry kind
    pub entry_type: EntryType,
    /// Mutation kind for row-data entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<OperationKind>,
    /// GTID of the enclosing transaction (`uuid:txid`), when GTID mode is
    /// active upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
}

/// Positional row images of one row-data entry.
///
/// Values line up with the table's ordered column list; the parser zips
/// them against cached metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Changed rows, in stream order
    pub rows: Vec<RowData>,
}

/// One row's before/after images as positional values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    /// Pre-image values (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<Value>>,
    /// Post-image values (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<Value>>,
}

/// One raw replication entry: header plus opaque store value.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    /// Entry header
    pub header: EntryHeader,
    /// Serialized row change; empty for non-row entries
    pub payload: Bytes,
}

impl RawEntry {
    /// Build a transaction-begin marker.
    pub fn transaction_begin(journal_file: impl Into<String>, offset: u64, ts: i64) -> Self {
        Self::marker(journal_file, offset, ts, EntryType::TransactionBegin)
    }

    /// Build a transaction-end (commit) marker. Its offset becomes the
    /// transaction group key.
    pub fn transaction_end(journal_file: impl Into<String>, offset: u64, ts: i64) -> Self {
        Self::marker(journal_file, offset, ts, EntryType::TransactionEnd)
    }

    /// Build a heartbeat entry.
    pub fn heartbeat(journal_file: impl Into<String>, offset: u64, ts: i64) -> Self {
        Self::marker(journal_file, offset, ts, EntryType::Heartbeat)
    }

    /// Build a DDL entry; the payload carries the statement text.
    pub fn ddl(
        journal_file: impl Into<String>,
        offset: u64,
        ts: i64,
        schema: impl Into<String>,
        table: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        let statement: String = statement.into();
        Self {
            header: EntryHeader {
                journal_file: journal_file.into(),
                offset,
                execute_time: ts,
                schema: schema.into(),
                table: table.into(),
                entry_type: EntryType::Ddl,
                event_kind: None,
                gtid: None,
            },
            payload: Bytes::from(statement.into_bytes()),
        }
    }

    fn marker(journal_file: impl Into<String>, offset: u64, ts: i64, entry_type: EntryType) -> Self {
        Self {
            header: EntryHeader {
                journal_file: journal_file.into(),
                offset,
                execute_time: ts,
                schema: String::new(),
                table: String::new(),
                entry_type,
                event_kind: None,
                gtid: None,
            },
            payload: Bytes::new(),
        }
    }

    /// Build a row-data entry from a decoded change (serializes the
    /// payload the way the upstream store does).
    pub fn row_data(
        journal_file: impl Into<String>,
        offset: u64,
        ts: i64,
        schema: impl Into<String>,
        table: impl Into<String>,
        kind: OperationKind,
        change: &RowChange,
    ) -> Result<Self> {
        Ok(Self {
            header: EntryHeader {
                journal_file: journal_file.into(),
                offset,
                execute_time: ts,
                schema: schema.into(),
                table: table.into(),
                entry_type: EntryType::RowData,
                event_kind: Some(kind),
                gtid: None,
            },
            payload: Bytes::from(serde_json::to_vec(change)?),
        })
    }

    /// Stamp the transaction GTID on the entry.
    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.header.gtid = Some(gtid.into());
        self
    }

    /// Decode the row payload.
    ///
    /// Fails with [`CdcError::Decode`] on malformed wire data; the caller
    /// must treat this as fatal for the whole fetch cycle.
    pub fn decode_rows(&self) -> Result<RowChange> {
        if self.header.entry_type != EntryType::RowData {
            return Err(CdcError::decode(format!(
                "entry at {}:{} is not row data",
                self.header.journal_file, self.header.offset
            )));
        }
        serde_json::from_slice(&self.payload).map_err(|e| {
            CdcError::decode(format!(
                "malformed row payload at {}:{}: {e}",
                self.header.journal_file, self.header.offset
            ))
        })
    }
}

/// One fetched unit of the replication subscription.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// Upstream cursor id; acknowledged exactly once after hand-off
    pub message_id: u64,
    /// Entries in stream order
    pub entries: Vec<RawEntry>,
}

impl RawBatch {
    /// Create a batch.
    pub fn new(message_id: u64, entries: Vec<RawEntry>) -> Self {
        Self {
            message_id,
            entries,
        }
    }

    /// Position of the last entry, used as the reconnect point once the
    /// batch is acknowledged.
    pub fn end_position(&self, server_identity: &str) -> Option<ReplicationPosition> {
        self.entries.last().map(|e| {
            let mut pos = ReplicationPosition::file_offset(
                server_identity,
                e.header.journal_file.clone(),
                e.header.offset,
            )
            .with_timestamp(e.header.execute_time);
            pos.current_gtid = e.header.gtid.clone();
            pos
        })
    }
}

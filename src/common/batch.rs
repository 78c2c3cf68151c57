//! Batch assembly
//!
//! Splits transaction groups into size-bounded batches and binds each batch
//! to resumable position metadata. The transaction group is the indivisible
//! unit of checkpoint progress: every batch cut from one group carries the
//! same partition and offset metadata, and groups are emitted in strictly
//! ascending offset-key order.

use crate::common::{CdcError, ChangeRecord, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Transaction groups keyed by their commit (Xid) offset. `BTreeMap` keeps
/// ascending key order, which the assembler relies on.
pub type TransactionGroups = BTreeMap<u64, Vec<ChangeRecord>>;

/// Partition metadata shared by all batches of one transaction group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPartition {
    /// Stable upstream server identity
    pub server_identity: String,
    /// Journal file the group was read from
    pub journal_name: String,
    /// Execute timestamp of the group's last record (epoch millis)
    pub timestamp: i64,
}

/// Offset metadata shared by all batches of one transaction group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOffset {
    /// The group's commit offset within the journal file
    pub offset: u64,
    /// Serialized GTID range; attached only when the group carried both
    /// halves of the GTID pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
    /// The group's own GTID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_gtid: Option<String>,
}

/// Extension metadata a downstream consumer uses to recognize transaction
/// continuity and reassemble or apply idempotently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordExtensions {
    /// Id of the fetched unit this batch was derived from
    pub message_id: u64,
    /// Index of this batch within its transaction group
    pub batch_index: usize,
    /// Total batches cut from the transaction group
    pub total_batches: usize,
}

/// Generic output record handed to downstream delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Partition metadata
    pub partition: RecordPartition,
    /// Offset metadata
    pub offset: RecordOffset,
    /// Wall-clock emit timestamp (epoch millis)
    pub emit_timestamp: i64,
    /// Batch continuity extensions
    pub extensions: RecordExtensions,
    /// Serialized slice of the group's change records (JSON array)
    pub payload: Vec<u8>,
}

impl SourceRecord {
    /// Deserialize the payload back into change records.
    pub fn records(&self) -> Result<Vec<ChangeRecord>> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Splits transaction groups into bounded batches bound to position
/// metadata.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    server_identity: String,
    batch_size: usize,
}

impl BatchAssembler {
    /// Create an assembler. `batch_size` must be non-zero.
    pub fn new(server_identity: impl Into<String>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(CdcError::config("batch size must be greater than zero"));
        }
        Ok(Self {
            server_identity: server_identity.into(),
            batch_size,
        })
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Assemble output records from the parsed groups of one fetched unit.
    ///
    /// Groups are visited in ascending offset-key order so that a crash
    /// after partially emitting group N never delivers group N+1 first;
    /// re-fetching from the last acknowledged unit then redelivers N in
    /// full (at-least-once).
    pub fn assemble(&self, message_id: u64, groups: &TransactionGroups) -> Result<Vec<SourceRecord>> {
        let emit_timestamp = epoch_millis();
        let mut out = Vec::new();

        for (&offset_key, records) in groups {
            let Some(last) = records.last() else {
                continue;
            };

            let partition = RecordPartition {
                server_identity: self.server_identity.clone(),
                journal_name: last.journal_file.clone(),
                timestamp: last.execute_time,
            };
            let (gtid, current_gtid) = match (&last.gtid, &last.current_gtid) {
                (Some(g), Some(c)) if !g.is_empty() && !c.is_empty() => {
                    (Some(g.clone()), Some(c.clone()))
                }
                _ => (None, None),
            };
            let offset = RecordOffset {
                offset: offset_key,
                gtid,
                current_gtid,
            };

            let total_batches = records.len().div_ceil(self.batch_size);
            for (batch_index, chunk) in records.chunks(self.batch_size).enumerate() {
                out.push(SourceRecord {
                    partition: partition.clone(),
                    offset: offset.clone(),
                    emit_timestamp,
                    extensions: RecordExtensions {
                        message_id,
                        batch_index,
                        total_batches,
                    },
                    payload: serde_json::to_vec(chunk)?,
                });
            }
        }

        Ok(out)
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RowImage;

    fn make_records(n: usize) -> Vec<ChangeRecord> {
        (0..n)
            .map(|i| {
                ChangeRecord::insert(
                    "shop",
                    "orders",
                    RowImage::new(),
                    "mysql-bin.000001",
                    1_700_000_000_000 + i as i64,
                )
            })
            .collect()
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        assert!(BatchAssembler::new("id", 0).is_err());
    }

    #[test]
    fn test_seven_records_batch_size_three() {
        let assembler = BatchAssembler::new("server-1", 3).unwrap();
        let mut groups = TransactionGroups::new();
        groups.insert(6163, make_records(7));

        let out = assembler.assemble(42, &groups).unwrap();
        assert_eq!(out.len(), 3);

        let sizes: Vec<usize> = out.iter().map(|r| r.records().unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        for (i, rec) in out.iter().enumerate() {
            assert_eq!(rec.extensions.message_id, 42);
            assert_eq!(rec.extensions.batch_index, i);
            assert_eq!(rec.extensions.total_batches, 3);
            // Identical partition/offset metadata on every batch.
            assert_eq!(rec.partition, out[0].partition);
            assert_eq!(rec.offset, out[0].offset);
        }
        assert_eq!(out[0].offset.offset, 6163);
        assert_eq!(out[0].partition.journal_name, "mysql-bin.000001");
        assert_eq!(out[0].partition.timestamp, 1_700_000_000_006);
    }

    #[test]
    fn test_batch_index_covers_range_exactly_once() {
        let assembler = BatchAssembler::new("s", 4).unwrap();
        let mut groups = TransactionGroups::new();
        groups.insert(100, make_records(10));

        let out = assembler.assemble(1, &groups).unwrap();
        let total = out[0].extensions.total_batches;
        assert_eq!(total, 3); // ceil(10/4)
        let mut seen: Vec<usize> = out.iter().map(|r| r.extensions.batch_index).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());
        assert!(out.iter().all(|r| r.records().unwrap().len() <= 4));
    }

    #[test]
    fn test_groups_emitted_in_ascending_key_order() {
        let assembler = BatchAssembler::new("s", 10).unwrap();
        let mut groups = TransactionGroups::new();
        // Insert out of order; BTreeMap sorts.
        groups.insert(900, make_records(2));
        groups.insert(300, make_records(1));
        groups.insert(600, make_records(3));

        let out = assembler.assemble(7, &groups).unwrap();
        let keys: Vec<u64> = out.iter().map(|r| r.offset.offset).collect();
        assert_eq!(keys, vec![300, 600, 900]);
    }

    #[test]
    fn test_gtid_attached_only_when_pair_complete() {
        let assembler = BatchAssembler::new("s", 10).unwrap();

        let mut groups = TransactionGroups::new();
        let with_pair = vec![ChangeRecord::insert(
            "db",
            "t",
            RowImage::new(),
            "mysql-bin.000001",
            0,
        )
        .with_gtid("uuid:1-5", "uuid:5")];
        groups.insert(10, with_pair);

        let mut half = ChangeRecord::insert("db", "t", RowImage::new(), "mysql-bin.000001", 0);
        half.gtid = Some("uuid:1-5".to_string());
        groups.insert(20, vec![half]);

        let out = assembler.assemble(1, &groups).unwrap();
        assert_eq!(out[0].offset.gtid.as_deref(), Some("uuid:1-5"));
        assert_eq!(out[0].offset.current_gtid.as_deref(), Some("uuid:5"));
        assert!(out[1].offset.gtid.is_none());
        assert!(out[1].offset.current_gtid.is_none());
    }

    #[test]
    fn test_empty_groups_produce_nothing() {
        let assembler = BatchAssembler::new("s", 3).unwrap();
        let mut groups = TransactionGroups::new();
        groups.insert(5, vec![]);
        assert!(assembler.assemble(1, &groups).unwrap().is_empty());
        assert!(assembler.assemble(1, &TransactionGroups::new()).unwrap().is_empty());
    }
}

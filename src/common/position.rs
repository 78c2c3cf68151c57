//! Replication positions and GTID sets
//!
//! A [`ReplicationPosition`] is the resumable cursor of one ingestion job:
//! journal file + byte offset, plus an optional GTID range when GTID mode is
//! enabled. Within one journal file the committed byte offset is
//! monotonically non-decreasing; the GTID set only ever extends.
//!
//! [`GtidSet`] is a structured interval set. The upstream store persists
//! GTID ranges as strings (`uuid:1-5,uuid:7`), but range arithmetic is done
//! on intervals and only serialized at the store boundary.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resumable position in the upstream replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPosition {
    /// Stable identity of the upstream server (server UUID on MySQL,
    /// server id on MariaDB)
    pub server_identity: String,
    /// Journal (binlog) file name, e.g. `mysql-bin.000003`
    pub journal_file: String,
    /// Byte offset within the journal file
    pub byte_offset: u64,
    /// Serialized GTID range covering everything consumed so far
    pub gtid: Option<String>,
    /// The single GTID of the most recently consumed transaction
    pub current_gtid: Option<String>,
    /// Execute timestamp of the event at this position (epoch millis)
    pub event_timestamp: i64,
}

impl ReplicationPosition {
    /// Create a file+offset position with no GTID information.
    pub fn file_offset(
        server_identity: impl Into<String>,
        journal_file: impl Into<String>,
        byte_offset: u64,
    ) -> Self {
        Self {
            server_identity: server_identity.into(),
            journal_file: journal_file.into(),
            byte_offset,
            gtid: None,
            current_gtid: None,
            event_timestamp: 0,
        }
    }

    /// Set the GTID pair.
    pub fn with_gtid(mut self, gtid: impl Into<String>, current: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self.current_gtid = Some(current.into());
        self
    }

    /// Set the event timestamp.
    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.event_timestamp = ts;
        self
    }

    /// Ordering key: lexical on (journal_file, byte_offset).
    pub fn key(&self) -> (&str, u64) {
        (&self.journal_file, self.byte_offset)
    }

    /// Serialize into the exact field shape the external position store
    /// persists, so the store's schema round-trips.
    pub fn to_persisted(&self) -> PersistedPosition {
        PersistedPosition {
            journal_name: self.journal_file.clone(),
            position: self.byte_offset,
            gtid: self.gtid.clone(),
            timestamp: self.event_timestamp,
        }
    }
}

/// The position row shape owned by the external store:
/// `{"journalName": ..., "position": ..., "gtid": ..., "timestamp": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPosition {
    /// Journal (binlog) file name
    pub journal_name: String,
    /// Byte offset within the journal file
    pub position: u64,
    /// Serialized GTID range, when GTID mode was enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
    /// Event timestamp (epoch millis)
    #[serde(default)]
    pub timestamp: i64,
}

impl PersistedPosition {
    /// Rehydrate into a pipeline position under the given server identity.
    pub fn into_position(self, server_identity: impl Into<String>) -> ReplicationPosition {
        ReplicationPosition {
            server_identity: server_identity.into(),
            journal_file: self.journal_name,
            byte_offset: self.position,
            gtid: self.gtid,
            current_gtid: None,
            event_timestamp: self.timestamp,
        }
    }
}

/// A single closed transaction-id interval, inclusive on both ends.
type Interval = (u64, u64);

/// Structured GTID set: per-server-UUID sorted interval lists.
///
/// External format: `uuid:1-5:7,uuid2:3` (intervals separated by `:`,
/// servers separated by `,`; a single id renders without `-`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    servers: BTreeMap<String, Vec<Interval>>,
}

impl GtidSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from the external string format.
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut pieces = part.split(':');
            let uuid = pieces
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| CdcError::decode(format!("malformed gtid set: {s}")))?;
            let mut any = false;
            for range in pieces {
                any = true;
                let interval = parse_interval(range)
                    .ok_or_else(|| CdcError::decode(format!("malformed gtid interval: {range}")))?;
                set.add_interval(uuid, interval);
            }
            if !any {
                return Err(CdcError::decode(format!("gtid without interval: {part}")));
            }
        }
        Ok(set)
    }

    /// Check whether the set has no intervals.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Extend the set with a single observed GTID (`uuid:txid`).
    ///
    /// The new range is the union of the previous range and the observed id,
    /// never a verbatim overwrite: this is what keeps the set resumable when
    /// many small transactions share one file offset.
    pub fn extend(&mut self, gtid: &str) -> Result<()> {
        let (uuid, txid) = gtid
            .rsplit_once(':')
            .ok_or_else(|| CdcError::decode(format!("malformed gtid: {gtid}")))?;
        let txid: u64 = txid
            .parse()
            .map_err(|_| CdcError::decode(format!("malformed gtid txid: {gtid}")))?;
        if uuid.is_empty() {
            return Err(CdcError::decode(format!("malformed gtid: {gtid}")));
        }
        self.add_interval(uuid, (txid, txid));
        Ok(())
    }

    /// Union another set into this one.
    pub fn union(&mut self, other: &GtidSet) {
        for (uuid, intervals) in &other.servers {
            for iv in intervals {
                self.add_interval(uuid, *iv);
            }
        }
    }

    /// Check whether a single GTID is covered.
    pub fn contains(&self, gtid: &str) -> bool {
        let Some((uuid, txid)) = gtid.rsplit_once(':') else {
            return false;
        };
        let Ok(txid) = txid.parse::<u64>() else {
            return false;
        };
        self.servers
            .get(uuid)
            .map(|ivs| ivs.iter().any(|&(s, e)| s <= txid && txid <= e))
            .unwrap_or(false)
    }

    fn add_interval(&mut self, uuid: &str, interval: Interval) {
        let intervals = self.servers.entry(uuid.to_string()).or_default();
        intervals.push(interval);
        intervals.sort_unstable();
        // Merge overlapping and adjacent intervals.
        let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
        for &(start, end) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        *intervals = merged;
    }
}

fn parse_interval(s: &str) -> Option<Interval> {
    match s.split_once('-') {
        Some((a, b)) => {
            let start: u64 = a.parse().ok()?;
            let end: u64 = b.parse().ok()?;
            (start <= end).then_some((start, end))
        }
        None => {
            let v: u64 = s.parse().ok()?;
            Some((v, v))
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.servers {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for &(start, end) in intervals {
                if start == end {
                    write!(f, ":{start}")?;
                } else {
                    write!(f, ":{start}-{end}")?;
                }
            }
        }
        Ok(())
    }
}

//! Entry parsing
//!
//! Turns the raw entries of one fetched unit into transaction groups of
//! [`ChangeRecord`]s. Rows are positional on the wire; the parser zips
//! them against cached table metadata to produce named column images.
//!
//! Grouping follows the transaction markers: row records accumulate as
//! pending until the commit entry arrives, whose byte offset becomes the
//! group key. The parser also maintains the running GTID range, extending
//! it whenever the enclosing transaction's GTID changes.

use crate::common::{
    CdcError, ChangeRecord, GtidSet, OperationKind, Result, RowImage, TransactionGroups,
};
use crate::mysql::entry::{EntryHeader, EntryType, RawBatch, RawEntry, RowData};
use crate::mysql::metadata::{TableDefinition, TableMetaCache};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stateful parser over consecutive fetched units.
pub struct EntryParser {
    gtid_mode: bool,
    filter_table_error: bool,
    ddl_sync: bool,
    field_filter: HashMap<String, HashSet<String>>,
    gtids: GtidSet,
    last_seen_gtid: Option<String>,
}

impl EntryParser {
    /// Create a parser.
    ///
    /// `filter_table_error` controls the unresolvable-table policy: when
    /// set, row entries whose metadata cannot be resolved are skipped with
    /// a warning instead of failing the whole unit. `ddl_sync` controls
    /// whether observed schema changes are surfaced in the logs; either
    /// way a DDL entry invalidates the table's cached metadata.
    pub fn new(gtid_mode: bool, filter_table_error: bool, ddl_sync: bool) -> Self {
        Self {
            gtid_mode,
            filter_table_error,
            ddl_sync,
            field_filter: HashMap::new(),
            gtids: GtidSet::new(),
            last_seen_gtid: None,
        }
    }

    /// Seed the running GTID range from a stored position.
    pub fn with_gtid_range(mut self, range: &str) -> Result<Self> {
        self.gtids = GtidSet::parse(range)?;
        Ok(self)
    }

    /// Restrict emitted columns per table. Keys are `schema.table`, values
    /// the columns to keep; tables without an entry keep every column.
    pub fn with_field_filter(mut self, filter: HashMap<String, Vec<String>>) -> Self {
        self.field_filter = filter
            .into_iter()
            .map(|(table, columns)| (table, columns.into_iter().collect()))
            .collect();
        self
    }

    /// The GTID range covering everything parsed so far.
    pub fn gtid_range(&self) -> &GtidSet {
        &self.gtids
    }

    /// Parse one fetched unit into transaction groups keyed by commit
    /// offset, in ascending key order.
    pub async fn parse(
        &mut self,
        batch: &RawBatch,
        cache: &TableMetaCache,
    ) -> Result<TransactionGroups> {
        let mut groups = TransactionGroups::new();
        let mut pending: Vec<ChangeRecord> = Vec::new();
        let mut last_header: Option<&EntryHeader> = None;

        for entry in &batch.entries {
            if self.gtid_mode {
                self.track_gtid(entry.header.gtid.as_deref());
            }
            match entry.header.entry_type {
                EntryType::Heartbeat => continue,
                EntryType::Ddl => {
                    self.handle_ddl(entry, cache).await;
                }
                EntryType::TransactionBegin => {
                    // A begin without a preceding commit marker: close the
                    // open group under the previous entry offset instead of
                    // dropping its rows.
                    if !pending.is_empty() {
                        warn!(
                            count = pending.len(),
                            "transaction begin with pending rows, closing open group"
                        );
                        if let Some(header) = last_header {
                            groups.entry(header.offset).or_default().append(&mut pending);
                        }
                    }
                }
                EntryType::RowData => {
                    let records = self.parse_row_entry(entry, cache).await?;
                    pending.extend(records);
                }
                EntryType::TransactionEnd => {
                    if !pending.is_empty() {
                        groups.insert(entry.header.offset, std::mem::take(&mut pending));
                    }
                }
            }
            last_header = Some(&entry.header);
        }

        // Rows without a commit marker in this unit (the upstream cut the
        // fetch mid-transaction): group them under the last entry offset so
        // they are not lost. The next unit re-delivers nothing; offsets
        // only move forward on ack.
        if !pending.is_empty() {
            if let Some(header) = last_header {
                debug!(
                    count = pending.len(),
                    offset = header.offset,
                    "grouping trailing rows without commit marker"
                );
                groups.entry(header.offset).or_default().append(&mut pending);
            }
        }

        Ok(groups)
    }

    /// A schema change makes the cached definition stale; drop it so the
    /// next row of this table re-pulls current metadata.
    async fn handle_ddl(&self, entry: &RawEntry, cache: &TableMetaCache) {
        let header = &entry.header;
        if header.schema.is_empty() || header.table.is_empty() {
            return;
        }
        cache.invalidate(&header.schema, &header.table).await;
        if self.ddl_sync {
            info!(
                schema = %header.schema,
                table = %header.table,
                statement = %String::from_utf8_lossy(&entry.payload),
                "schema change observed"
            );
        }
    }

    async fn parse_row_entry(
        &self,
        entry: &RawEntry,
        cache: &TableMetaCache,
    ) -> Result<Vec<ChangeRecord>> {
        let header = &entry.header;
        let definition = match cache.resolve(&header.schema, &header.table).await {
            Ok(def) => def,
            Err(e @ CdcError::SchemaNotFound { .. }) => {
                if self.filter_table_error {
                    warn!(
                        schema = %header.schema,
                        table = %header.table,
                        "skipping rows for unresolvable table"
                    );
                    return Ok(Vec::new());
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let kind = header.event_kind.ok_or_else(|| {
            CdcError::decode(format!(
                "row entry without event kind at {}:{}",
                header.journal_file, header.offset
            ))
        })?;

        let change = entry.decode_rows()?;
        let mut records = Vec::with_capacity(change.rows.len());
        for row in &change.rows {
            let record = self
                .build_record(header, kind, row, &definition, cache)
                .await?;
            records.push(record);
        }
        Ok(records)
    }

    async fn build_record(
        &self,
        header: &EntryHeader,
        kind: OperationKind,
        row: &RowData,
        definition: &Arc<TableDefinition>,
        cache: &TableMetaCache,
    ) -> Result<ChangeRecord> {
        let before = match &row.before {
            Some(values) => Some(self.zip_image(header, values, definition, cache).await?),
            None => None,
        };
        let after = match &row.after {
            Some(values) => Some(self.zip_image(header, values, definition, cache).await?),
            None => None,
        };

        let mut record = match kind {
            OperationKind::Insert => {
                let after = after.ok_or_else(|| missing_image(header, "after"))?;
                ChangeRecord::insert(
                    &header.schema,
                    &header.table,
                    after,
                    &header.journal_file,
                    header.execute_time,
                )
            }
            OperationKind::Update => {
                let after = after.ok_or_else(|| missing_image(header, "after"))?;
                ChangeRecord::update(
                    &header.schema,
                    &header.table,
                    before,
                    after,
                    &header.journal_file,
                    header.execute_time,
                )
            }
            OperationKind::Delete => {
                let before = before.ok_or_else(|| missing_image(header, "before"))?;
                ChangeRecord::delete(
                    &header.schema,
                    &header.table,
                    before,
                    &header.journal_file,
                    header.execute_time,
                )
            }
        };

        if self.gtid_mode {
            if let Some(current) = header.gtid.as_deref() {
                record = record.with_gtid(self.gtids.to_string(), current);
            }
        }
        Ok(record)
    }

    /// Zip positional values against the column list. An arity mismatch
    /// means the cached definition is stale (DDL happened upstream): the
    /// entry is invalidated so the next resolve re-pulls it, and the unit
    /// fails for re-fetch.
    async fn zip_image(
        &self,
        header: &EntryHeader,
        values: &[Value],
        definition: &Arc<TableDefinition>,
        cache: &TableMetaCache,
    ) -> Result<RowImage> {
        if values.len() != definition.columns.len() {
            warn!(
                schema = %header.schema,
                table = %header.table,
                expected = definition.columns.len(),
                got = values.len(),
                "column count mismatch, invalidating cached metadata"
            );
            cache.invalidate(&header.schema, &header.table).await;
            return Err(CdcError::schema_not_found(&header.schema, &header.table));
        }
        let allowed = self
            .field_filter
            .get(&format!("{}.{}", header.schema, header.table));
        Ok(definition
            .column_names()
            .zip(values.iter().cloned())
            .filter(|(name, _)| allowed.map_or(true, |cols| cols.contains(*name)))
            .map(|(name, value)| (name.to_string(), value))
            .collect())
    }

    fn track_gtid(&mut self, gtid: Option<&str>) {
        let Some(gtid) = gtid else {
            return;
        };
        if self.last_seen_gtid.as_deref() == Some(gtid) {
            return;
        }
        match self.gtids.extend(gtid) {
            Ok(()) => self.last_seen_gtid = Some(gtid.to_string()),
            Err(e) => warn!(gtid, error = %e, "ignoring malformed gtid"),
        }
    }
}

fn missing_image(header: &EntryHeader, which: &str) -> CdcError {
    CdcError::decode(format!(
        "row entry without {which} image at {}:{}",
        header.journal_file, header.offset
    ))
}

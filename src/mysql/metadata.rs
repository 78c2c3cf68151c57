//! Table metadata cache and startup probes
//!
//! Binlog row events carry values positionally, without column names, so
//! the parser needs the ordered column list of every captured table. The
//! cache pulls definitions from INFORMATION_SCHEMA once at startup for all
//! filtered tables and refreshes lazily after an explicit
//! [`TableMetaCache::invalidate`].
//!
//! Definitions are immutable behind `Arc`: a refresh swaps the map entry
//! (copy-on-write), so a parse already holding a definition never observes
//! a half-updated column list.

use crate::common::{CdcError, Result, TableFilter};
use mysql_async::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQL_SELECT_COLUMNS: &str = r"
    SELECT COLUMN_NAME, DATA_TYPE, COLUMN_KEY
    FROM INFORMATION_SCHEMA.COLUMNS
    WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION
";

const SQL_SELECT_VERSION: &str = "SELECT VERSION()";
const SQL_SERVER_UUID_MYSQL: &str = "SELECT @@server_uuid";
const SQL_SERVER_UUID_MARIADB: &str = "SELECT CAST(@@global.server_id AS CHAR)";

/// One column of a captured table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// Upstream SQL type name
    pub sql_type: String,
    /// Whether the column is part of the primary key
    pub primary_key: bool,
}

/// Ordered schema definition of one captured table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// Schema (database) name
    pub schema: String,
    /// Table name
    pub table: String,
    /// Columns in ordinal position order
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    /// Column names in ordinal order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Primary-key column names.
    pub fn primary_keys(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }
}

/// Upstream database flavor, probed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceKind {
    /// Stock MySQL
    MySql,
    /// MariaDB (no GTID-set resume support)
    MariaDb,
}

impl DataSourceKind {
    /// Whether the upstream is MariaDB.
    pub fn is_mariadb(&self) -> bool {
        matches!(self, DataSourceKind::MariaDb)
    }
}

/// Probe the upstream flavor from its version string.
pub async fn probe_kind(pool: &mysql_async::Pool) -> Result<DataSourceKind> {
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| CdcError::connect(format!("version probe: {e}")))?;
    let version: Option<String> = conn
        .query_first(SQL_SELECT_VERSION)
        .await
        .map_err(|e| CdcError::connect(format!("version probe: {e}")))?;
    // conn returns to the pool on drop, including on the error paths above.
    drop(conn);

    let version = version.unwrap_or_default();
    let kind = if version.to_lowercase().contains("mariadb") {
        DataSourceKind::MariaDb
    } else {
        DataSourceKind::MySql
    };
    info!("upstream version {version}, kind {kind:?}");
    Ok(kind)
}

/// Probe the upstream server identity (server UUID on MySQL, server id on
/// MariaDB).
pub async fn probe_server_identity(
    pool: &mysql_async::Pool,
    kind: DataSourceKind,
) -> Result<String> {
    let sql = if kind.is_mariadb() {
        SQL_SERVER_UUID_MARIADB
    } else {
        SQL_SERVER_UUID_MYSQL
    };
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| CdcError::connect(format!("server identity probe: {e}")))?;
    let identity: Option<String> = conn
        .query_first(sql)
        .await
        .map_err(|e| CdcError::connect(format!("server identity probe: {e}")))?;
    drop(conn);

    match identity {
        Some(id) if !id.is_empty() => {
            info!("upstream server identity {id}");
            Ok(id)
        }
        _ => Err(CdcError::connect("upstream returned empty server identity")),
    }
}

/// Copy-on-write cache of table definitions for the filtered table set.
pub struct TableMetaCache {
    pool: Option<mysql_async::Pool>,
    filter: TableFilter,
    tables: RwLock<HashMap<(String, String), Arc<TableDefinition>>>,
}

impl TableMetaCache {
    /// Create a cache backed by a metadata connection pool.
    pub fn new(pool: mysql_async::Pool, filter: TableFilter) -> Self {
        Self {
            pool: Some(pool),
            filter,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cache pre-seeded with definitions and no upstream pool.
    /// Resolution failures are then terminal; used by embedded setups and
    /// tests.
    pub fn with_tables(filter: TableFilter, definitions: Vec<TableDefinition>) -> Self {
        let tables = definitions
            .into_iter()
            .map(|d| ((d.schema.clone(), d.table.clone()), Arc::new(d)))
            .collect();
        Self {
            pool: None,
            filter,
            tables: RwLock::new(tables),
        }
    }

    /// The configured table filter.
    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    /// Pull definitions for every filtered table. Called once at startup.
    /// A pool-less cache keeps its seeded definitions as-is.
    pub async fn start(&self) -> Result<()> {
        if self.pool.is_none() {
            debug!("no metadata pool, keeping seeded definitions");
            return Ok(());
        }
        let pairs: Vec<(String, String)> = self
            .filter
            .pairs()
            .map(|(s, t)| (s.to_string(), t.to_string()))
            .collect();
        for (schema, table) in pairs {
            let def = self.load_table(&schema, &table).await?;
            self.tables
                .write()
                .await
                .insert((schema, table), Arc::new(def));
        }
        info!("loaded metadata for {} tables", self.filter.len());
        Ok(())
    }

    /// Resolve the definition of a captured table.
    ///
    /// Fails with [`CdcError::SchemaNotFound`] when the table is outside
    /// the configured filter or its metadata cannot be loaded. Callers must
    /// not silently skip rows on this error unless the fail-table policy
    /// explicitly allows it.
    pub async fn resolve(&self, schema: &str, table: &str) -> Result<Arc<TableDefinition>> {
        if !self.filter.should_capture(schema, table) {
            return Err(CdcError::schema_not_found(schema, table));
        }
        let key = (schema.to_string(), table.to_string());
        if let Some(def) = self.tables.read().await.get(&key) {
            return Ok(Arc::clone(def));
        }
        // Invalidated or never loaded: refresh from upstream.
        let def = Arc::new(self.load_table(schema, table).await?);
        self.tables
            .write()
            .await
            .insert(key, Arc::clone(&def));
        Ok(def)
    }

    /// Drop a cached definition so the next resolve re-pulls it. The
    /// parser calls this when positional row data no longer lines up with
    /// the cached column order.
    pub async fn invalidate(&self, schema: &str, table: &str) {
        let removed = self
            .tables
            .write()
            .await
            .remove(&(schema.to_string(), table.to_string()));
        if removed.is_some() {
            debug!("invalidated metadata for {schema}.{table}");
        }
    }

    async fn load_table(&self, schema: &str, table: &str) -> Result<TableDefinition> {
        let Some(pool) = &self.pool else {
            warn!("no metadata pool, cannot load {schema}.{table}");
            return Err(CdcError::schema_not_found(schema, table));
        };

        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| CdcError::connect(format!("metadata connection: {e}")))?;
        let rows: Vec<(String, String, String)> = conn
            .exec(SQL_SELECT_COLUMNS, (schema, table))
            .await
            .map_err(|e| {
                warn!("failed to query columns for {schema}.{table}: {e}");
                CdcError::schema_not_found(schema, table)
            })?;
        drop(conn);

        if rows.is_empty() {
            return Err(CdcError::schema_not_found(schema, table));
        }

        let columns = rows
            .into_iter()
            .map(|(name, sql_type, key)| ColumnDefinition {
                name,
                sql_type,
                primary_key: key == "PRI",
            })
            .collect();
        debug!("loaded metadata for {schema}.{table}");
        Ok(TableDefinition {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DatabaseSpec;

    fn users_def() -> TableDefinition {
        TableDefinition {
            schema: "shop".into(),
            table: "users".into(),
            columns: vec![
                ColumnDefinition {
                    name: "id".into(),
                    sql_type: "bigint".into(),
                    primary_key: true,
                },
                ColumnDefinition {
                    name: "name".into(),
                    sql_type: "varchar".into(),
                    primary_key: false,
                },
            ],
        }
    }

    fn filter() -> TableFilter {
        TableFilter::from_specs(&[DatabaseSpec::new("shop", &["users"])], false).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_seeded_table() {
        let cache = TableMetaCache::with_tables(filter(), vec![users_def()]);
        let def = cache.resolve("shop", "users").await.unwrap();
        assert_eq!(def.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
        assert_eq!(def.primary_keys().collect::<Vec<_>>(), vec!["id"]);
    }

    #[tokio::test]
    async fn test_start_without_pool_keeps_seeded_definitions() {
        let cache = TableMetaCache::with_tables(filter(), vec![users_def()]);
        cache.start().await.unwrap();
        assert!(cache.resolve("shop", "users").await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_outside_filter_fails() {
        let cache = TableMetaCache::with_tables(filter(), vec![users_def()]);
        let err = cache.resolve("shop", "audit_log").await.unwrap_err();
        assert!(matches!(err, CdcError::SchemaNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_without_pool_is_terminal() {
        let cache = TableMetaCache::with_tables(filter(), vec![users_def()]);
        cache.invalidate("shop", "users").await;
        // No pool to re-pull from: stale metadata must not be re-served.
        assert!(cache.resolve("shop", "users").await.is_err());
    }

    #[tokio::test]
    async fn test_definitions_are_shared_snapshots() {
        let cache = TableMetaCache::with_tables(filter(), vec![users_def()]);
        let held = cache.resolve("shop", "users").await.unwrap();
        cache.invalidate("shop", "users").await;
        // A reader holding the old Arc still sees a consistent definition.
        assert_eq!(held.columns.len(), 2);
    }

    #[test]
    fn test_data_source_kind() {
        assert!(DataSourceKind::MariaDb.is_mariadb());
        assert!(!DataSourceKind::MySql.is_mariadb());
    }
}

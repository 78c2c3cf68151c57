//! # mesh-cdc - Binlog Change Data Capture Source
//!
//! Tails a MySQL/MariaDB replication stream and turns raw mutation events
//! into ordered, checkpointable change records for downstream delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐
//! │ MySQL/MariaDB │
//! │    Binlog     │
//! └───────┬───────┘
//!         │ fetch (no ack)
//!         ▼
//! ┌────────────────────┐     ┌──────────────────┐
//! │ BinlogStreamClient │◄────┤ TransportFactory │
//! └───────┬────────────┘     └──────────────────┘
//!         │ RawBatch
//!         ▼
//! ┌────────────────────┐     ┌──────────────────┐
//! │    EntryParser     │◄────┤  TableMetaCache  │
//! └───────┬────────────┘     └──────────────────┘
//!         │ TransactionGroups
//!         ▼
//! ┌────────────────────┐
//! │   BatchAssembler   │
//! └───────┬────────────┘
//!         │ SourceRecord batches
//!         ▼
//!   caller hand-off ──► commit ──► ack upstream
//! ```
//!
//! The unit of progress is the fetched unit: it is acknowledged upstream
//! only after every record cut from it was handed off, so a crash anywhere
//! in the cycle re-delivers the unit (at-least-once, never lost).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example(
//! #     factory: Box<dyn mesh_cdc::mysql::TransportFactory>,
//! #     store: mesh_cdc::common::SharedPositionStore,
//! # ) -> anyhow::Result<()> {
//! use mesh_cdc::common::DatabaseSpec;
//! use mesh_cdc::mysql::{
//!     BinlogSource, BinlogSourceConfig, DataSourceKind, TableMetaCache,
//! };
//! use std::sync::Arc;
//!
//! let config = BinlogSourceConfig::new("db.example", "repl", "secret", "orders", "job-1")
//!     .with_database(DatabaseSpec::new("shop", &["orders"]));
//!
//! let pool = mysql_async::Pool::new(config.metadata_opts());
//! let kind = mesh_cdc::mysql::probe_kind(&pool).await?;
//! let cache = Arc::new(TableMetaCache::new(pool, config.table_filter()?));
//!
//! let mut source = BinlogSource::build(config, store, factory, cache, kind).await?;
//! source.start().await?;
//! loop {
//!     let records = source.poll().await?;
//!     if records.is_empty() {
//!         break; // cancelled
//!     }
//!     // hand records off downstream, then:
//!     source.commit().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod mysql;

pub use common::{CdcError, ChangeRecord, OperationKind, Result, SourceRecord};
pub use mysql::{BinlogSource, BinlogSourceConfig};

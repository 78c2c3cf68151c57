//! # MySQL/MariaDB Binlog Source
//!
//! The database-specific half of the pipeline:
//!
//! - [`RawEntry`] / [`RawBatch`] - Wire entry model of a fetched unit
//! - [`TableMetaCache`] - Column metadata for positional row decoding
//! - [`BinlogStreamClient`] - Fetch/ack cycle over a [`BinlogTransport`]
//! - [`EntryParser`] - Entries to transaction groups of change records
//! - [`BinlogSource`] - The assembled poll/commit pipeline

mod client;
mod entry;
mod metadata;
mod parser;
mod source;

pub use client::*;
pub use entry::*;
pub use metadata::*;
pub use parser::*;
pub use source::*;

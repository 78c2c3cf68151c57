//! # Common CDC Types
//!
//! Database-agnostic pieces of the CDC source pipeline:
//!
//! - [`CdcError`] - Error taxonomy (connect, schema, decode, ack)
//! - [`ChangeRecord`] - Row-level mutation representation
//! - [`ReplicationPosition`] / [`GtidSet`] - Resumable position state
//! - [`TableFilter`] - Fail-safe table inclusion filter
//! - [`BatchAssembler`] - Transaction-group splitting + offset binding
//! - [`EmptyPollBackoff`] - Busy-spin avoidance for empty polls
//! - [`PositionStore`] - Read-side contract of the external checkpoint store

mod backoff;
mod batch;
mod error;
mod filter;
mod position;
mod record;
mod store;

pub use backoff::*;
pub use batch::*;
pub use error::*;
pub use filter::*;
pub use position::*;
pub use record::*;
pub use store::*;

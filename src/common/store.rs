//! Position store interface
//!
//! The store itself is owned by the control plane; the pipeline only reads
//! the last committed position and the job's server identity through this
//! trait. A missing position is a fresh start, not an error: the stream
//! then begins at the current head.

use crate::common::{ReplicationPosition, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-side contract of the external position store.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Load the last committed position for a job, if any.
    async fn load(&self, job_id: &str) -> Result<Option<ReplicationPosition>>;

    /// Resolve the stable server identity recorded for a job.
    async fn server_identity(&self, job_id: &str) -> Result<String>;
}

/// Shared position store handle.
pub type SharedPositionStore = Arc<dyn PositionStore>;

/// In-memory position store for tests and embedded use.
#[derive(Debug)]
pub struct MemoryPositionStore {
    identity: String,
    positions: RwLock<HashMap<String, ReplicationPosition>>,
}

impl MemoryPositionStore {
    /// Create an empty store resolving every job to `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Record a position for a job.
    pub async fn save(&self, job_id: &str, position: ReplicationPosition) {
        self.positions
            .write()
            .await
            .insert(job_id.to_string(), position);
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self, job_id: &str) -> Result<Option<ReplicationPosition>> {
        Ok(self.positions.read().await.get(job_id).cloned())
    }

    async fn server_identity(&self, _job_id: &str) -> Result<String> {
        Ok(self.identity.clone())
    }
}

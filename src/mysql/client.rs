//! Replication stream client
//!
//! [`BinlogStreamClient`] owns one subscription to the upstream
//! replication stream and enforces the at-least-once fetch/ack cycle: a
//! fetched unit stays in flight until it is explicitly acknowledged, and a
//! reconnect always resumes from the last *acknowledged* position, never
//! from the read cursor.
//!
//! The actual wire transport sits behind [`BinlogTransport`] so the same
//! client drives a real binlog connection, an embedded store, or a
//! scripted stream in tests. [`TransportFactory`] produces a fresh
//! transport per (re)connect, carrying the resume point into the new
//! session.

use crate::common::{CdcError, GtidSet, ReplicationPosition, Result};
use crate::mysql::entry::RawBatch;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a (re)connected transport should start reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Current head of the stream (fresh job, no checkpoint)
    Head,
    /// Journal file and byte offset
    FileOffset {
        /// Journal (binlog) file name
        journal_file: String,
        /// Byte offset within the journal file
        byte_offset: u64,
    },
    /// GTID range covering everything already consumed
    Gtid(GtidSet),
}

impl ResumeFrom {
    /// Derive the resume mode from a stored position.
    ///
    /// GTID resume requires both GTID mode and a non-empty stored range;
    /// on MariaDB the stored range is ignored with a warning because the
    /// upstream cannot resume from a MySQL-style GTID set.
    pub fn from_position(
        position: &ReplicationPosition,
        gtid_mode: bool,
        mariadb: bool,
    ) -> Result<Self> {
        if gtid_mode {
            if let Some(gtid) = position.gtid.as_deref().filter(|g| !g.is_empty()) {
                if mariadb {
                    warn!("gtid resume not supported on mariadb, falling back to file offset");
                } else {
                    return Ok(ResumeFrom::Gtid(GtidSet::parse(gtid)?));
                }
            }
        }
        Ok(ResumeFrom::FileOffset {
            journal_file: position.journal_file.clone(),
            byte_offset: position.byte_offset,
        })
    }
}

/// Wire-level transport of the replication subscription.
///
/// `next_batch` returns `Ok(None)` when no data is available right now;
/// the caller decides whether to time out, back off, or retry. Transports
/// are single-session: on any error the client drops the transport and
/// asks the factory for a new one.
#[async_trait]
pub trait BinlogTransport: Send {
    /// Fetch the next unit of at most `hint` entries without
    /// acknowledging it.
    async fn next_batch(&mut self, hint: usize) -> Result<Option<RawBatch>>;

    /// Acknowledge a previously fetched unit by its cursor id.
    async fn ack(&mut self, message_id: u64) -> Result<()>;
}

/// Produces a connected transport for a resume point.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a new session starting at `resume`.
    async fn create(&self, resume: &ResumeFrom) -> Result<Box<dyn BinlogTransport>>;
}

/// Receives failover notifications from the HA controller.
///
/// The watch value is a failover epoch; any change means the upstream
/// address may have moved and the current session must be torn down.
#[derive(Debug, Clone)]
pub struct HaMonitor {
    epochs: watch::Receiver<u64>,
    seen: u64,
}

impl HaMonitor {
    /// Create a monitor and the sending half handed to the HA controller.
    pub fn new() -> (HaHandle, Self) {
        let (tx, rx) = watch::channel(0);
        (
            HaHandle { epochs: tx },
            Self {
                epochs: rx,
                seen: 0,
            },
        )
    }

    /// Check for a failover signal since the last check, without waiting.
    pub fn failover_pending(&mut self) -> bool {
        let current = *self.epochs.borrow();
        if current != self.seen {
            self.seen = current;
            true
        } else {
            false
        }
    }
}

/// Sending half of the failover signal.
#[derive(Debug, Clone)]
pub struct HaHandle {
    epochs: watch::Sender<u64>,
}

impl HaHandle {
    /// Signal that the upstream may have moved.
    pub fn trigger_failover(&self) {
        self.epochs.send_modify(|epoch| *epoch += 1);
    }
}

/// Client over one replication subscription.
pub struct BinlogStreamClient {
    destination: String,
    gtid_mode: bool,
    mariadb: bool,
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn BinlogTransport>>,
    ha: Option<HaMonitor>,
    cancel: CancellationToken,
    last_acked: ResumeFrom,
    in_flight: Option<(u64, Option<ReplicationPosition>)>,
}

impl BinlogStreamClient {
    /// Create a disconnected client. `destination` names the subscription
    /// in logs only.
    pub fn new(
        destination: impl Into<String>,
        gtid_mode: bool,
        mariadb: bool,
        factory: Box<dyn TransportFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            destination: destination.into(),
            gtid_mode,
            mariadb,
            factory,
            transport: None,
            ha: None,
            cancel,
            last_acked: ResumeFrom::Head,
            in_flight: None,
        }
    }

    /// Attach a failover monitor.
    pub fn with_ha_monitor(mut self, ha: HaMonitor) -> Self {
        self.ha = Some(ha);
        self
    }

    /// The resume point of the next (re)connect.
    pub fn resume_point(&self) -> &ResumeFrom {
        &self.last_acked
    }

    /// Open the subscription, resuming from a stored position when one
    /// exists.
    pub async fn connect(&mut self, stored: Option<&ReplicationPosition>) -> Result<()> {
        self.last_acked = match stored {
            Some(pos) => ResumeFrom::from_position(pos, self.gtid_mode, self.mariadb)?,
            None => ResumeFrom::Head,
        };
        info!(
            destination = %self.destination,
            resume = ?self.last_acked,
            "connecting replication stream"
        );
        self.transport = Some(self.factory.create(&self.last_acked).await?);
        Ok(())
    }

    /// Tear down the current session and reopen it at the last
    /// acknowledged position. Any unacknowledged unit is abandoned and
    /// will be re-fetched.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.transport = None;
        self.in_flight = None;
        info!(
            destination = %self.destination,
            resume = ?self.last_acked,
            "reconnecting replication stream"
        );
        self.transport = Some(self.factory.create(&self.last_acked).await?);
        Ok(())
    }

    /// Fetch the next unit without acknowledging it.
    ///
    /// With `timeout_ms >= 0` the call waits up to the timeout for data
    /// and returns `Ok(None)` once it elapses. `timeout_ms < 0` makes a
    /// single immediate attempt; the caller paces retries, which is what
    /// keeps blocking mode responsive to backoff and cancellation. Fails
    /// with [`CdcError::InvalidState`] while a previous unit is still
    /// unacknowledged, and reconnects at the last acknowledged position
    /// on transport errors or a pending failover signal.
    pub async fn fetch(&mut self, hint: usize, timeout_ms: i64) -> Result<Option<RawBatch>> {
        if let Some((id, _)) = &self.in_flight {
            return Err(CdcError::invalid_state(format!(
                "unit {id} still unacknowledged"
            )));
        }
        if self.ha.as_mut().is_some_and(|ha| ha.failover_pending()) {
            warn!(destination = %self.destination, "failover signalled, reconnecting");
            self.reconnect().await?;
        }

        let fetched = if timeout_ms < 0 {
            self.fetch_once(hint).await?
        } else {
            let deadline = Duration::from_millis(timeout_ms as u64);
            match tokio::time::timeout(deadline, self.fetch_blocking(hint)).await {
                Ok(result) => result?,
                Err(_) => None,
            }
        };

        if let Some(batch) = &fetched {
            self.in_flight = Some((batch.message_id, None));
            debug!(
                message_id = batch.message_id,
                entries = batch.entries.len(),
                "fetched unit"
            );
        }
        Ok(fetched)
    }

    /// Record the position the in-flight unit ends at, so acknowledging it
    /// advances the resume point.
    pub fn bind_end_position(&mut self, message_id: u64, end: ReplicationPosition) -> Result<()> {
        match &mut self.in_flight {
            Some((id, slot)) if *id == message_id => {
                *slot = Some(end);
                Ok(())
            }
            _ => Err(CdcError::invalid_state(format!(
                "unit {message_id} is not in flight"
            ))),
        }
    }

    /// Acknowledge the in-flight unit, advancing the resume point to its
    /// end position. Must only be called after the unit's records were
    /// handed off downstream.
    pub async fn acknowledge(&mut self, message_id: u64) -> Result<()> {
        let (id, end) = self
            .in_flight
            .take()
            .ok_or_else(|| CdcError::invalid_state("no unit in flight"))?;
        if id != message_id {
            self.in_flight = Some((id, end));
            return Err(CdcError::invalid_state(format!(
                "ack for unit {message_id} but unit {id} is in flight"
            )));
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| CdcError::invalid_state("not connected"))?;
        if let Err(e) = transport.ack(message_id).await {
            // Restore so the caller can retry the ack after reconnecting.
            self.in_flight = Some((id, end));
            return Err(CdcError::ack(format!("ack of unit {message_id}: {e}")));
        }

        if let Some(end) = end {
            self.last_acked = ResumeFrom::from_position(&end, self.gtid_mode, self.mariadb)?;
        }
        debug!(message_id, "acknowledged unit");
        Ok(())
    }

    async fn fetch_once(&mut self, hint: usize) -> Result<Option<RawBatch>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| CdcError::invalid_state("not connected"))?;
        match transport.next_batch(hint).await {
            Ok(batch) => Ok(batch),
            Err(e) if e.is_retriable() => {
                warn!(destination = %self.destination, error = %e, "fetch failed, reconnecting");
                self.reconnect().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll the transport until data arrives or the client is cancelled.
    async fn fetch_blocking(&mut self, hint: usize) -> Result<Option<RawBatch>> {
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                fetched = self.fetch_once(hint) => {
                    if let Some(batch) = fetched? {
                        return Ok(Some(batch));
                    }
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

//! Binlog CDC source
//!
//! [`BinlogSource`] drives the full ingestion cycle: fetch a unit from the
//! replication stream, parse it into transaction groups, assemble bounded
//! output batches, hand them to the caller, and acknowledge the unit only
//! after the hand-off succeeded. Acknowledgement is split into an explicit
//! [`BinlogSource::commit`] so a crash between poll and commit re-delivers
//! the unit instead of losing it (at-least-once).

use crate::common::{
    BatchAssembler, CdcError, DatabaseSpec, EmptyPollBackoff, PersistedPosition,
    ReplicationPosition, Result, SharedPositionStore, SourceRecord, TableFilter,
};
use crate::mysql::client::{BinlogStreamClient, HaMonitor, TransportFactory};
use crate::mysql::metadata::{DataSourceKind, TableMetaCache};
use crate::mysql::parser::EntryParser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_PORT: u16 = 3306;
const DEFAULT_CHARSET: &str = "utf8mb4";
const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_BATCH_TIMEOUT_MS: i64 = 1000;

/// Configuration of one binlog ingestion job.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogSourceConfig {
    /// Upstream host
    pub host: String,
    /// Upstream port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Replication user
    pub username: String,
    /// Replication password
    pub password: String,
    /// Connection character set
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Server id this client presents to the upstream; consumed by the
    /// transport. Zero lets the transport pick one.
    #[serde(default)]
    pub server_id: u32,
    /// Subscription name, used in logs and downstream metadata
    pub destination: String,
    /// Job id under which positions are checkpointed
    pub job_id: String,
    /// Captured databases and tables
    #[serde(default)]
    pub databases: Vec<DatabaseSpec>,
    /// Capture every table; must be set explicitly when `databases` is
    /// empty, otherwise nothing is captured
    #[serde(default)]
    pub match_all: bool,
    /// Maximum change records per output batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fetch timeout in milliseconds; negative blocks until data arrives
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: i64,
    /// Track GTIDs and attach the running range to records
    #[serde(default)]
    pub gtid_mode: bool,
    /// Log observed schema change statements
    #[serde(default)]
    pub ddl_sync: bool,
    /// Skip rows of unresolvable tables instead of failing the unit
    #[serde(default)]
    pub filter_table_error: bool,
    /// Per-table column restriction, keyed `schema.table`
    #[serde(default)]
    pub field_filter: HashMap<String, Vec<String>>,
    /// Explicit start positions, used when the store has no checkpoint;
    /// the earliest one wins
    #[serde(default)]
    pub record_positions: Vec<PersistedPosition>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_timeout_ms() -> i64 {
    DEFAULT_BATCH_TIMEOUT_MS
}

impl BinlogSourceConfig {
    /// Minimal config for host/credentials; everything else defaulted.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        destination: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            charset: default_charset(),
            server_id: 0,
            destination: destination.into(),
            job_id: job_id.into(),
            databases: Vec::new(),
            match_all: false,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            gtid_mode: false,
            ddl_sync: false,
            filter_table_error: false,
            field_filter: HashMap::new(),
            record_positions: Vec::new(),
        }
    }

    /// Add a captured database.
    pub fn with_database(mut self, spec: DatabaseSpec) -> Self {
        self.databases.push(spec);
        self
    }

    /// Set the output batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the fetch timeout; negative blocks.
    pub fn with_batch_timeout_ms(mut self, ms: i64) -> Self {
        self.batch_timeout_ms = ms;
        self
    }

    /// Enable GTID tracking.
    pub fn with_gtid_mode(mut self, on: bool) -> Self {
        self.gtid_mode = on;
        self
    }

    /// Skip rows of unresolvable tables instead of failing.
    pub fn with_filter_table_error(mut self, on: bool) -> Self {
        self.filter_table_error = on;
        self
    }

    /// Build the compiled table filter.
    pub fn table_filter(&self) -> Result<TableFilter> {
        TableFilter::from_specs(&self.databases, self.match_all)
    }

    /// Connection options for the metadata pool.
    pub fn metadata_opts(&self) -> mysql_async::Opts {
        mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .init(vec![format!("SET NAMES {}", self.charset)])
            .into()
    }
}

impl fmt::Debug for BinlogSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinlogSourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("charset", &self.charset)
            .field("server_id", &self.server_id)
            .field("destination", &self.destination)
            .field("job_id", &self.job_id)
            .field("databases", &self.databases)
            .field("match_all", &self.match_all)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout_ms", &self.batch_timeout_ms)
            .field("gtid_mode", &self.gtid_mode)
            .field("ddl_sync", &self.ddl_sync)
            .field("filter_table_error", &self.filter_table_error)
            .finish()
    }
}

/// Where the source currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Not started or between cycles
    Idle,
    /// Waiting on the replication stream
    Fetching,
    /// Converting a fetched unit into records
    Parsing,
    /// Records handed to the caller, awaiting commit
    Emitting,
    /// Acknowledging the emitted unit upstream
    Acknowledging,
    /// Shut down
    Stopped,
}

/// The binlog CDC source pipeline.
pub struct BinlogSource {
    config: BinlogSourceConfig,
    client: BinlogStreamClient,
    cache: Arc<TableMetaCache>,
    parser: EntryParser,
    assembler: BatchAssembler,
    backoff: EmptyPollBackoff,
    state: PollState,
    cancel: CancellationToken,
    server_identity: String,
    stored: Option<ReplicationPosition>,
    pending_ack: Option<u64>,
}

impl BinlogSource {
    /// Assemble a source from its parts, resolving the resume position
    /// from the store (falling back to the configured start position, then
    /// to the stream head).
    pub async fn build(
        config: BinlogSourceConfig,
        store: SharedPositionStore,
        factory: Box<dyn TransportFactory>,
        cache: Arc<TableMetaCache>,
        kind: DataSourceKind,
    ) -> Result<Self> {
        let server_identity = store.server_identity(&config.job_id).await?;
        let stored = match store.load(&config.job_id).await? {
            Some(pos) => Some(pos),
            // The earliest configured position keeps delivery a superset
            // of what an uninterrupted run would have produced.
            None => config
                .record_positions
                .iter()
                .min_by_key(|p| (p.journal_name.clone(), p.position))
                .cloned()
                .map(|p| p.into_position(server_identity.clone())),
        };

        let mut parser = EntryParser::new(
            config.gtid_mode,
            config.filter_table_error,
            config.ddl_sync,
        )
        .with_field_filter(config.field_filter.clone());
        if let Some(gtid) = stored.as_ref().and_then(|p| p.gtid.as_deref()) {
            parser = parser.with_gtid_range(gtid)?;
        }
        let assembler = BatchAssembler::new(server_identity.clone(), config.batch_size)?;
        let cancel = CancellationToken::new();
        let client = BinlogStreamClient::new(
            config.destination.clone(),
            config.gtid_mode,
            kind.is_mariadb(),
            factory,
            cancel.clone(),
        );

        Ok(Self {
            config,
            client,
            cache,
            parser,
            assembler,
            backoff: EmptyPollBackoff::new(),
            state: PollState::Idle,
            cancel,
            server_identity,
            stored,
            pending_ack: None,
        })
    }

    /// Attach a failover monitor before starting.
    pub fn with_ha_monitor(mut self, ha: HaMonitor) -> Self {
        self.client = self.client.with_ha_monitor(ha);
        self
    }

    /// Current cycle state.
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Token cancelling the source; cloneable for external shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load table metadata and open the replication stream.
    pub async fn start(&mut self) -> Result<()> {
        self.cache.start().await?;
        self.client.connect(self.stored.as_ref()).await?;
        info!(
            destination = %self.config.destination,
            job_id = %self.config.job_id,
            "binlog source started"
        );
        Ok(())
    }

    /// Fetch and convert the next non-empty unit.
    ///
    /// Blocks through empty fetches with adaptive backoff until records
    /// are available or the source is cancelled (then returns an empty
    /// vec). Units that parse to nothing (heartbeats, filtered tables)
    /// are acknowledged inline since there is nothing to hand off. Fails
    /// while a previous poll awaits [`BinlogSource::commit`].
    pub async fn poll(&mut self) -> Result<Vec<SourceRecord>> {
        if let Some(id) = self.pending_ack {
            return Err(CdcError::invalid_state(format!(
                "unit {id} emitted but not committed"
            )));
        }

        loop {
            if self.cancel.is_cancelled() {
                self.state = PollState::Stopped;
                return Ok(Vec::new());
            }

            self.state = PollState::Fetching;
            let fetched = self
                .client
                .fetch(self.config.batch_size, self.config.batch_timeout_ms)
                .await?;
            let Some(batch) = fetched else {
                if self.cancel.is_cancelled() {
                    self.state = PollState::Stopped;
                    return Ok(Vec::new());
                }
                // Bounded fetches pace the loop themselves; only the
                // blocking mode needs the adaptive wait.
                if self.config.batch_timeout_ms < 0 {
                    self.backoff.wait().await;
                }
                continue;
            };
            self.backoff.reset();

            self.state = PollState::Parsing;
            let groups = self.parser.parse(&batch, &self.cache).await?;
            if let Some(mut end) = batch.end_position(&self.server_identity) {
                if self.config.gtid_mode && !self.parser.gtid_range().is_empty() {
                    end.gtid = Some(self.parser.gtid_range().to_string());
                }
                self.client.bind_end_position(batch.message_id, end)?;
            }

            let records = self.assembler.assemble(batch.message_id, &groups)?;
            if records.is_empty() {
                debug!(message_id = batch.message_id, "unit carried no records");
                if let Err(e) = self.client.acknowledge(batch.message_id).await {
                    warn!(error = %e, "ack of dataless unit failed, reconnecting");
                    self.client.reconnect().await?;
                }
                continue;
            }

            self.state = PollState::Emitting;
            self.pending_ack = Some(batch.message_id);
            return Ok(records);
        }
    }

    /// Acknowledge the unit emitted by the last poll. Call only after the
    /// records were durably handed off. On failure the unit stays pending
    /// so the commit can be retried.
    pub async fn commit(&mut self) -> Result<()> {
        let id = self
            .pending_ack
            .take()
            .ok_or_else(|| CdcError::invalid_state("no emitted unit to commit"))?;
        self.state = PollState::Acknowledging;
        if let Err(e) = self.client.acknowledge(id).await {
            self.pending_ack = Some(id);
            self.state = PollState::Emitting;
            return Err(e);
        }
        self.state = PollState::Idle;
        Ok(())
    }

    /// Run the poll/commit cycle, sending records into `tx` until the
    /// source is cancelled or the receiver closes. Each unit is committed
    /// only after all of its records were accepted by the channel.
    pub async fn run(&mut self, tx: mpsc::Sender<SourceRecord>) -> Result<()> {
        loop {
            let records = match self.poll().await {
                Ok(records) => records,
                Err(e) if e.is_retriable() => {
                    warn!(error = %e, "poll failed, retrying");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "poll failed");
                    self.state = PollState::Stopped;
                    return Err(e);
                }
            };
            if records.is_empty() {
                // Only cancellation yields an empty poll.
                self.state = PollState::Stopped;
                return Ok(());
            }

            for record in records {
                if tx.send(record).await.is_err() {
                    info!("receiver closed, stopping source");
                    self.cancel.cancel();
                    self.state = PollState::Stopped;
                    return Ok(());
                }
            }
            self.commit().await?;
        }
    }

    /// Request shutdown. The in-flight unit, if any, stays unacknowledged
    /// and will be re-fetched on the next start.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        info!(destination = %self.config.destination, "binlog source stopping");
    }
}

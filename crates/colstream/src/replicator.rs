//! The replication reader and event router.
//!
//! Owns the connection to the primary, the table-id to processor map, and
//! the GTID progress. One reader task fetches events, routes row work to
//! per-table workers, serializes DDL behind a flush of all pending row
//! work, and advances the durable GTID when a transaction's commit fan-out
//! succeeds on every processor.
//!
//! Any sink-side failure surfaces at the next commit fan-out: the reader
//! drops the upstream connection and reconnects from the durable GTID, so
//! the failed transaction is replayed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bulk::{BulkDriver, SqlBulkDriver};
use crate::config::Config;
use crate::ddl::extract_table_names;
use crate::error::{ReplicationError, Result};
use crate::event::ReplicationEvent;
use crate::executor::SqlExecutor;
use crate::processor::Worker;
use crate::protocol::BinlogClient;
use crate::table::{TableSchema, TableSink};

/// Delay between reconnection attempts after the primary becomes
/// unreachable.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct Shared {
    running: AtomicBool,
    reader_active: AtomicBool,
    /// Consecutive commit fan-out failures; two in a row means the same
    /// failure survived a reconnect.
    commit_failures: AtomicU32,
    error: Mutex<String>,
}

impl Shared {
    fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        if !message.is_empty() {
            *self.error.lock().unwrap_or_else(|e| e.into_inner()) = message;
        }
    }
}

/// A running replication pipeline.
pub struct Replicator {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Replicator {
    /// Validate the configuration and start the reader.
    ///
    /// Rows are delivered through the built-in SQL-backed bulk driver.
    pub fn start(config: Config) -> Result<Self> {
        let driver = Arc::new(SqlBulkDriver::new(config.sink_server.clone()));
        Self::start_with_driver(config, driver)
    }

    /// Start with a custom bulk-insert driver.
    pub fn start_with_driver(config: Config, driver: Arc<dyn BulkDriver>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            reader_active: AtomicBool::new(true),
            commit_failures: AtomicU32::new(0),
            error: Mutex::new(String::new()),
        });

        let reader = Reader::new(config, shared.clone(), driver);
        let handle = tokio::spawn(reader.run());

        Ok(Self {
            shared,
            reader: Some(handle),
        })
    }

    /// Whether the pipeline is making progress.
    ///
    /// False once the reader has exited, or when a processor failure has
    /// survived a reconnect (the same transaction failed twice).
    pub fn ok(&self) -> bool {
        self.shared.reader_active.load(Ordering::Acquire)
            && self.shared.commit_failures.load(Ordering::Acquire) < 2
    }

    /// The most recent error message, empty if none.
    pub fn error(&self) -> String {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Request a clean stop and wait for the reader and all workers.
    pub async fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);

        if let Some(handle) = self.reader.take() {
            if handle.await.is_err() {
                warn!("reader task panicked");
            }
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

/// One live per-table processor.
struct TableEntry {
    id: u64,
    name: String,
    worker: Worker,
}

/// State owned by the reader task.
struct Reader {
    config: Config,
    shared: Arc<Shared>,
    driver: Arc<dyn BulkDriver>,
    conn: Option<BinlogClient>,
    /// Table-id to processor map, in insertion order
    tables: Vec<TableEntry>,
    executor: Worker,
    /// GTID of the transaction currently being read
    current: String,
    /// GTID of the last transaction whose sink-side commit succeeded
    durable: String,
}

impl Reader {
    fn new(config: Config, shared: Arc<Shared>, driver: Arc<dyn BulkDriver>) -> Self {
        let executor = spawn_executor(&config);
        let durable = config.gtid.clone();

        Self {
            config,
            shared,
            driver,
            conn: None,
            tables: Vec::new(),
            executor,
            current: durable.clone(),
            durable,
        }
    }

    async fn run(mut self) {
        while self.shared.running.load(Ordering::Acquire) {
            if self.conn.is_none() {
                match self.connect().await {
                    Ok(client) => self.conn = Some(client),
                    Err(err) => {
                        warn!(error = %err, "connection to primary failed");
                        self.shared.set_error(err.to_string());
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                }
            }

            let Some(client) = self.conn.as_mut() else {
                continue;
            };

            match client.fetch_event().await {
                Ok(Some(event)) => {
                    if !self.should_process(&event) {
                        continue;
                    }
                    if let Err(err) = self.dispatch(event).await {
                        warn!(error = %err, "event dispatch failed, replaying from durable GTID");
                        self.shared.set_error(err.to_string());
                        self.shared.commit_failures.fetch_add(1, Ordering::AcqRel);
                        self.disconnect().await;
                    }
                }
                Ok(None) => {
                    warn!("replication stream ended");
                    self.disconnect().await;
                }
                Err(err) => {
                    warn!(error = %err, "replication stream broke");
                    self.shared.set_error(err.to_string());
                    self.disconnect().await;
                }
            }
        }

        info!("reader stopping");
        for entry in self.tables.drain(..) {
            entry.worker.shutdown().await;
        }
        self.executor.shutdown().await;
        self.shared.reader_active.store(false, Ordering::Release);
    }

    /// Connect to the first reachable candidate and run the GTID
    /// handshake. Any statement failure is fatal for the attempt; the
    /// caller backs off and retries.
    async fn connect(&mut self) -> Result<BinlogClient> {
        let mut client = BinlogClient::connect_any(&self.config.primary_servers).await?;

        // Order matters: checksum capture and capability level must
        // precede the GTID connect state.
        let handshake = vec![
            "SET @master_binlog_checksum = @@global.binlog_checksum".to_string(),
            "SET @mariadb_slave_capability=4".to_string(),
            format!("SET @slave_connect_state='{}'", self.durable),
            "SET @slave_gtid_strict_mode=1".to_string(),
            "SET @slave_gtid_ignore_duplicates=1".to_string(),
            "SET NAMES latin1".to_string(),
            "SET @master_heartbeat_period=1000000000".to_string(),
        ];

        client
            .query_batch(&handshake)
            .await
            .map_err(|err| ReplicationError::protocol(format!("handshake failed: {err}")))?;

        client.replicate(self.config.server_id).await?;

        info!(
            server = %client.server(),
            gtid = %self.durable,
            "replicating from primary"
        );

        // The in-flight transaction, if any, was abandoned with the old
        // connection and will be re-read.
        self.current = self.durable.clone();
        Ok(client)
    }

    /// Drop the connection and all per-table state; the replay from the
    /// durable GTID will re-deliver table maps and row events.
    async fn disconnect(&mut self) {
        self.conn = None;

        for entry in self.tables.drain(..) {
            entry.worker.shutdown().await;
        }

        let fresh = spawn_executor(&self.config);
        let old = std::mem::replace(&mut self.executor, fresh);
        old.shutdown().await;
    }

    fn spawn_table(&self, map: &crate::event::TableMapEvent) -> Worker {
        let sink = TableSink::new(
            TableSchema::from(map),
            self.config.mode,
            self.config.sink_server.clone(),
            self.driver.clone(),
        );
        Worker::spawn(Box::new(sink), self.config.flush_interval)
    }

    /// Apply the configured table filter: table maps by their own name,
    /// query events by every referenced table, everything else by the
    /// fate of its preceding table map.
    fn should_process(&self, event: &ReplicationEvent) -> bool {
        if self.config.tables.is_empty() {
            return true;
        }

        match event {
            ReplicationEvent::TableMap(map) => {
                let name = format!("{}.{}", map.database, map.table);
                self.config.tables.contains(&name)
            }
            ReplicationEvent::Query(query) => {
                let names = extract_table_names(&query.statement, &query.database);
                names.iter().all(|name| self.config.tables.contains(name))
            }
            _ => true,
        }
    }

    async fn dispatch(&mut self, event: ReplicationEvent) -> Result<()> {
        match event {
            ReplicationEvent::Gtid(gtid) => {
                self.current = gtid.to_string();
                trace!(gtid = %self.current, "transaction start");
            }

            ReplicationEvent::Xid(_) => {
                self.commit_all().await?;
                self.durable = self.current.clone();
                self.shared.commit_failures.store(0, Ordering::Release);
                trace!(gtid = %self.durable, "transaction durable");
            }

            ReplicationEvent::TableMap(map) => {
                let name = format!("{}.{}", map.database, map.table);
                debug!(table_id = map.table_id, table = %name, "table map");

                match self.tables.iter().position(|entry| entry.id == map.table_id) {
                    Some(pos) if self.tables[pos].name == name => {
                        // Table maps precede every row event; refresh the
                        // snapshot in queue order so pending work is kept.
                        self.tables[pos]
                            .worker
                            .enqueue(ReplicationEvent::TableMap(map));
                    }
                    Some(pos) => {
                        // The numeric id now belongs to a different table
                        let worker = self.spawn_table(&map);
                        let old = std::mem::replace(
                            &mut self.tables[pos],
                            TableEntry {
                                id: map.table_id,
                                name,
                                worker,
                            },
                        );
                        old.worker.shutdown().await;
                    }
                    None => {
                        let worker = self.spawn_table(&map);
                        self.tables.push(TableEntry {
                            id: map.table_id,
                            name,
                            worker,
                        });
                    }
                }
            }

            ReplicationEvent::Query(query) => {
                let statement = query.statement.trim();
                if statement.eq_ignore_ascii_case("BEGIN") {
                    // Transaction start marker, not DDL
                    return Ok(());
                }

                debug!(database = %query.database, statement = %query.statement, "query event");

                // All pending row work must be durable before the DDL runs
                self.commit_all().await?;

                self.executor.enqueue(ReplicationEvent::Query(query));
                if !self.executor.commit().await {
                    return Err(ReplicationError::sink(format!(
                        "DDL execution failed: {}",
                        self.executor.last_error()
                    )));
                }
            }

            ReplicationEvent::Rows(rows) => {
                match self.tables.iter().find(|entry| entry.id == rows.table_id) {
                    Some(entry) => entry.worker.enqueue(ReplicationEvent::Rows(rows)),
                    None => {
                        // The preceding table map was filtered out
                        trace!(table_id = rows.table_id, "row event dropped");
                    }
                }
            }

            ReplicationEvent::Rotate { position, file } => {
                debug!(file = %file, position, "binlog rotate");
            }

            ReplicationEvent::FormatDescription { checksum } => {
                debug!(checksum, "format description");
            }

            ReplicationEvent::Heartbeat => {}

            ReplicationEvent::Ignored(event_type) => {
                trace!(?event_type, "ignoring event");
            }
        }

        Ok(())
    }

    /// Commit every open processor in insertion order, the executor last.
    async fn commit_all(&mut self) -> Result<()> {
        for entry in &self.tables {
            if !entry.worker.commit().await {
                return Err(ReplicationError::sink(format!(
                    "processor for {} failed: {}",
                    entry.name,
                    entry.worker.last_error()
                )));
            }
        }

        if !self.executor.commit().await {
            return Err(ReplicationError::sink(format!(
                "DDL processor failed: {}",
                self.executor.last_error()
            )));
        }

        Ok(())
    }
}

fn spawn_executor(config: &Config) -> Worker {
    let executor = SqlExecutor::new(vec![config.sink_server.clone()], config.sink_engine.clone());
    Worker::spawn(Box::new(executor), config.flush_interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Server;
    use crate::event::{GtidEvent, QueryEvent, TableMapEvent};
    use bytes::Bytes;

    fn test_config() -> Config {
        Config::new(Server::new("primary", 3306), Server::new("sink", 3306))
    }

    fn reader_with_tables(tables: &[&str]) -> Reader {
        let mut config = test_config();
        for table in tables {
            config = config.include_table(*table);
        }

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            reader_active: AtomicBool::new(true),
            commit_failures: AtomicU32::new(0),
            error: Mutex::new(String::new()),
        });

        let driver = Arc::new(SqlBulkDriver::new(config.sink_server.clone()));
        Reader::new(config, shared, driver)
    }

    fn table_map(db: &str, table: &str) -> ReplicationEvent {
        ReplicationEvent::TableMap(TableMapEvent {
            table_id: 1,
            database: db.to_string(),
            table: table.to_string(),
            column_count: 0,
            column_types: Vec::new(),
            metadata: Bytes::new(),
        })
    }

    fn query(db: &str, statement: &str) -> ReplicationEvent {
        ReplicationEvent::Query(QueryEvent {
            database: db.to_string(),
            statement: statement.to_string(),
        })
    }

    #[tokio::test]
    async fn empty_table_set_accepts_everything() {
        let reader = reader_with_tables(&[]);
        assert!(reader.should_process(&table_map("a", "y")));
        assert!(reader.should_process(&query("a", "DROP TABLE y")));
    }

    #[tokio::test]
    async fn table_maps_are_filtered_by_qualified_name() {
        let reader = reader_with_tables(&["a.x"]);
        assert!(reader.should_process(&table_map("a", "x")));
        assert!(!reader.should_process(&table_map("a", "y")));
    }

    #[tokio::test]
    async fn query_events_require_every_referenced_table() {
        let reader = reader_with_tables(&["a.x"]);
        assert!(reader.should_process(&query("a", "ALTER TABLE x ADD COLUMN c INT")));
        assert!(!reader.should_process(&query("a", "ALTER TABLE y ADD COLUMN c INT")));
        assert!(!reader.should_process(&query("a", "INSERT INTO x SELECT * FROM y")));
    }

    #[tokio::test]
    async fn non_table_events_pass_the_filter() {
        let reader = reader_with_tables(&["a.x"]);
        assert!(reader.should_process(&ReplicationEvent::Xid(1)));
        assert!(reader.should_process(&ReplicationEvent::Gtid(GtidEvent {
            domain_id: 0,
            server_id: 1,
            sequence_nr: 2,
            flags: 0,
        })));
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut config = test_config();
        config.primary_servers.clear();
        assert!(Replicator::start(config).is_err());
    }
}

//! Pipeline configuration.
//!
//! A [`Config`] is taken by value when the replicator starts; there is no
//! process-wide configuration state. Builder methods follow the usual
//! `with_*` convention.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ReplicationError, Result};

/// One candidate server: a network endpoint plus credentials.
///
/// Grouped into ordered lists for failover selection; the first candidate
/// that accepts a connection wins.
#[derive(Clone, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: "root".to_string(),
            password: String::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// How UPDATE and DELETE row events are delivered to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Convert UPDATE/DELETE row events into equivalent SQL statements
    #[default]
    Replicate,
    /// Rewrite UPDATE/DELETE row events as appended inserts
    Transform,
}

impl std::str::FromStr for Mode {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replicate" => Ok(Mode::Replicate),
            "transform" => Ok(Mode::Transform),
            other => Err(ReplicationError::config(format!(
                "unknown mode '{other}', expected 'replicate' or 'transform'"
            ))),
        }
    }
}

/// Configuration for one replication pipeline.
#[derive(Clone)]
pub struct Config {
    /// Ordered list of primary candidates to replicate from
    pub primary_servers: Vec<Server>,
    /// Server ID presented during replication registration
    pub server_id: u32,
    /// Starting GTID; empty means "from the current position"
    pub gtid: String,
    /// Fully qualified `database.table` identifiers to include; empty = all
    pub tables: HashSet<String>,
    /// The analytic store the decoded rows are delivered to
    pub sink_server: Server,
    /// Path to the bulk-insert driver configuration file
    pub sink_driver_config: Option<PathBuf>,
    /// Storage engine forced onto forwarded DDL sessions
    pub sink_engine: String,
    /// Longest time a processor may hold uncommitted data before draining
    pub flush_interval: Duration,
    /// Delivery mode for UPDATE/DELETE events
    pub mode: Mode,
}

impl Config {
    pub fn new(primary: Server, sink: Server) -> Self {
        Self {
            primary_servers: vec![primary],
            server_id: 1234,
            gtid: String::new(),
            tables: HashSet::new(),
            sink_server: sink,
            sink_driver_config: None,
            sink_engine: "COLUMNSTORE".to_string(),
            flush_interval: Duration::from_secs(5),
            mode: Mode::default(),
        }
    }

    pub fn with_primary(mut self, server: Server) -> Self {
        self.primary_servers.push(server);
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = gtid.into();
        self
    }

    pub fn include_table(mut self, table: impl Into<String>) -> Self {
        self.tables.insert(table.into());
        self
    }

    pub fn with_driver_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink_driver_config = Some(path.into());
        self
    }

    pub fn with_sink_engine(mut self, engine: impl Into<String>) -> Self {
        self.sink_engine = engine.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate the configuration before the pipeline starts.
    ///
    /// Configuration errors are not recoverable; the process refuses to
    /// start rather than limping along with a partial setup.
    pub fn validate(&self) -> Result<()> {
        if self.primary_servers.is_empty() {
            return Err(ReplicationError::config("no primary servers configured"));
        }

        if self.server_id == 0 {
            return Err(ReplicationError::config("server_id must be non-zero"));
        }

        if !self.gtid.is_empty() {
            parse_gtid(&self.gtid)?;
        }

        for table in &self.tables {
            let mut parts = table.splitn(2, '.');
            let db = parts.next().unwrap_or_default();
            let tbl = parts.next().unwrap_or_default();
            if db.is_empty() || tbl.is_empty() {
                return Err(ReplicationError::config(format!(
                    "table identifier '{table}' is not of the form database.table"
                )));
            }
        }

        if self.flush_interval.is_zero() {
            return Err(ReplicationError::config("flush_interval must be non-zero"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("primary_servers", &self.primary_servers)
            .field("server_id", &self.server_id)
            .field("gtid", &self.gtid)
            .field("tables", &self.tables)
            .field("sink_server", &self.sink_server)
            .field("sink_driver_config", &self.sink_driver_config)
            .field("sink_engine", &self.sink_engine)
            .field("flush_interval", &self.flush_interval)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Parse a `domain-server-sequence` GTID into its numeric components.
pub fn parse_gtid(gtid: &str) -> Result<(u32, u32, u64)> {
    let mut parts = gtid.split('-');

    let err = || {
        ReplicationError::config(format!(
            "GTID '{gtid}' is not of the form domain-server-sequence"
        ))
    };

    let domain = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    let server = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
    let sequence = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;

    if parts.next().is_some() {
        return Err(err());
    }

    Ok((domain, server, sequence))
}

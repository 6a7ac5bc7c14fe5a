//! CLI argument parsing for the replication daemon.
//!
//! Endpoints and credentials come from flags or environment variables; an
//! optional JSON configuration file provides defaults that flags override.
//! A single positional argument overrides the starting GTID.

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use colstream::{Config, Mode, Server};

/// colstreamd - replicate a MariaDB primary into a columnar analytic store
#[derive(Parser, Debug)]
#[command(name = "colstreamd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Primary candidates, comma-separated host:port list in failover order
    #[arg(long, value_delimiter = ',', env = "COLSTREAM_PRIMARY")]
    pub primary: Vec<String>,

    /// Username for the primary servers
    #[arg(long, default_value = "repl", env = "COLSTREAM_USER")]
    pub user: String,

    /// Password for the primary servers
    #[arg(long, default_value = "", env = "COLSTREAM_PASSWORD")]
    pub password: String,

    /// Sink endpoint as host:port
    #[arg(long, env = "COLSTREAM_SINK")]
    pub sink: Option<String>,

    /// Username for the sink
    #[arg(long, default_value = "root", env = "COLSTREAM_SINK_USER")]
    pub sink_user: String,

    /// Password for the sink
    #[arg(long, default_value = "", env = "COLSTREAM_SINK_PASSWORD")]
    pub sink_password: String,

    /// Storage engine forced onto forwarded DDL
    #[arg(long, default_value = "COLUMNSTORE", env = "COLSTREAM_SINK_ENGINE")]
    pub sink_engine: String,

    /// Server ID presented during replication registration
    #[arg(long, default_value_t = 1234, env = "COLSTREAM_SERVER_ID")]
    pub server_id: u32,

    /// Tables to include as database.table, comma-separated; empty = all
    #[arg(long, value_delimiter = ',', env = "COLSTREAM_TABLES")]
    pub tables: Vec<String>,

    /// Delivery mode for UPDATE/DELETE events
    #[arg(long, default_value = "replicate", env = "COLSTREAM_MODE")]
    pub mode: String,

    /// Max milliseconds a processor may hold uncommitted data
    #[arg(long, default_value_t = 5000, env = "COLSTREAM_FLUSH_INTERVAL_MS")]
    pub flush_interval_ms: u64,

    /// Path to the bulk-insert driver configuration file
    #[arg(long, env = "COLSTREAM_DRIVER_CONFIG")]
    pub driver_config: Option<PathBuf>,

    /// JSON configuration file providing defaults for the options above
    #[arg(long, short = 'c', env = "COLSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Starting GTID, overriding the configured one
    pub gtid: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    primary: Vec<FileServer>,
    sink: Option<FileServer>,
    server_id: Option<u32>,
    gtid: Option<String>,
    #[serde(default)]
    tables: Vec<String>,
    mode: Option<String>,
    flush_interval_ms: Option<u64>,
    driver_config: Option<PathBuf>,
    sink_engine: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    user: Option<String>,
    password: Option<String>,
}

fn default_port() -> u16 {
    3306
}

impl Cli {
    /// Merge the file defaults and flags into a pipeline configuration.
    pub fn into_config(self) -> anyhow::Result<Config> {
        let file: FileConfig = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let mut primaries = Vec::new();
        for endpoint in &self.primary {
            let (host, port) = parse_endpoint(endpoint)?;
            primaries
                .push(Server::new(host, port).with_credentials(&self.user, &self.password));
        }
        if primaries.is_empty() {
            for server in &file.primary {
                primaries.push(
                    Server::new(server.host.clone(), server.port).with_credentials(
                        server.user.as_deref().unwrap_or(&self.user),
                        server.password.as_deref().unwrap_or(&self.password),
                    ),
                );
            }
        }
        if primaries.is_empty() {
            bail!("no primary servers given (use --primary or a config file)");
        }

        let sink = if let Some(endpoint) = &self.sink {
            let (host, port) = parse_endpoint(endpoint)?;
            Server::new(host, port).with_credentials(&self.sink_user, &self.sink_password)
        } else if let Some(server) = &file.sink {
            Server::new(server.host.clone(), server.port).with_credentials(
                server.user.as_deref().unwrap_or(&self.sink_user),
                server.password.as_deref().unwrap_or(&self.sink_password),
            )
        } else {
            bail!("no sink server given (use --sink or a config file)");
        };

        let mut config = Config::new(primaries.remove(0), sink);
        for server in primaries {
            config = config.with_primary(server);
        }

        config = config
            .with_server_id(file.server_id.unwrap_or(self.server_id))
            .with_sink_engine(file.sink_engine.unwrap_or(self.sink_engine))
            .with_flush_interval(Duration::from_millis(
                file.flush_interval_ms.unwrap_or(self.flush_interval_ms),
            ));

        // File mode applies only when the flag was left at its default
        let mode: Mode = match file.mode.as_deref() {
            Some(mode) if self.mode == "replicate" => mode.parse()?,
            _ => self.mode.parse()?,
        };
        config = config.with_mode(mode);

        for table in file.tables.iter().chain(self.tables.iter()) {
            config = config.include_table(table.clone());
        }

        if let Some(path) = self.driver_config.or(file.driver_config) {
            config = config.with_driver_config(path);
        }

        // The positional argument wins over every other GTID source
        if let Some(gtid) = self.gtid.or(file.gtid) {
            config = config.with_gtid(gtid);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_endpoint(endpoint: &str) -> anyhow::Result<(String, u16)> {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in '{endpoint}'"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((endpoint.to_string(), 3306)),
    }
}

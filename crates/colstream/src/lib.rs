//! # colstream - MariaDB replication into a columnar analytic store
//!
//! Subscribes to a MariaDB-family primary's replication stream, decodes
//! the binary row-change log into typed column values, and delivers the
//! rows to a columnar analytic store.
//!
//! Two delivery modes coexist:
//! - **Replicate**: contiguous inserts are grouped into bulk-insert
//!   batches; deletes and updates are issued as equivalent SQL statements.
//! - **Transform**: deletes and updates are rewritten as appended inserts,
//!   keeping full row history at the sink.
//!
//! ## Architecture
//!
//! ```text
//! MariaDB primary → BinlogClient → Replicator ─┬→ TableSink (worker) → bulk / SQL
//!                                              ├→ TableSink (worker) → bulk / SQL
//!                                              └→ SqlExecutor (worker) → DDL
//! ```
//!
//! One reader task fetches and routes events; one worker per table drains
//! its own queue, so events for a table apply in primary-log order while
//! tables proceed concurrently. On each transaction boundary the reader
//! commits every open processor before advancing the durable GTID, which
//! is the replay point after any failure.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use colstream::{Config, Replicator, Server};
//!
//! # async fn example() -> colstream::Result<()> {
//! let config = Config::new(
//!     Server::new("primary.example", 3306).with_credentials("repl", "secret"),
//!     Server::new("sink.example", 3306).with_credentials("writer", "secret"),
//! )
//! .with_server_id(4321)
//! .with_gtid("0-1-100")
//! .include_table("shop.orders");
//!
//! let mut replicator = Replicator::start(config)?;
//! while replicator.ok() {
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! }
//! replicator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod config;
pub mod connection;
pub mod convert;
pub mod ddl;
pub mod decode;
pub mod error;
pub mod event;
pub mod executor;
pub mod processor;
pub mod protocol;
pub mod replicator;
pub mod table;

pub use bulk::{BulkDriver, BulkInsert, BulkValue, SqlBulkDriver};
pub use config::{parse_gtid, Config, Mode, Server};
pub use connection::SqlSession;
pub use error::{ReplicationError, Result};
pub use event::{EventType, GtidEvent, QueryEvent, ReplicationEvent, RowsEvent, RowsKind, TableMapEvent};
pub use processor::{Processor, State, Worker};
pub use replicator::Replicator;
pub use table::{TableDescriptor, TableSchema, TableSink};

//! SQL sessions against the sink and other result-set-bearing endpoints.
//!
//! Wraps one `mysql_async` connection. Sessions are created from an ordered
//! candidate list; the first server that accepts the connection wins and is
//! remembered for diagnostics.

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Value};
use tracing::{debug, warn};

use crate::config::Server;
use crate::error::{ReplicationError, Result};

/// One open SQL session.
pub struct SqlSession {
    conn: Conn,
    server: Server,
}

impl SqlSession {
    /// Connect to the first reachable candidate, in list order.
    ///
    /// On full failure the error carries the last candidate's message.
    pub async fn connect(candidates: &[Server]) -> Result<Self> {
        let mut last_error = "no candidate servers".to_string();

        for server in candidates {
            match Self::connect_one(server).await {
                Ok(session) => {
                    debug!(server = %server, "SQL session established");
                    return Ok(session);
                }
                Err(err) => {
                    warn!(server = %server, error = %err, "candidate connection failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(ReplicationError::connection(last_error))
    }

    pub async fn connect_one(server: &Server) -> Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(server.host.clone())
            .tcp_port(server.port)
            .user(Some(server.user.clone()))
            .pass(Some(server.password.clone()));

        let conn = Conn::new(opts).await?;

        Ok(Self {
            conn,
            server: server.clone(),
        })
    }

    /// Which candidate this session is connected to.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Execute one statement, discarding any result set.
    pub async fn execute(&mut self, stmt: &str) -> Result<()> {
        self.conn.query_drop(stmt).await.map_err(Into::into)
    }

    /// Execute a sequence of statements, stopping at the first failure.
    ///
    /// No implicit transaction boundaries; callers supply their own
    /// `BEGIN`/`COMMIT` when atomicity is wanted.
    pub async fn execute_batch(&mut self, stmts: &[String]) -> Result<()> {
        for stmt in stmts {
            self.execute(stmt).await?;
        }
        Ok(())
    }

    /// Fetch a result set as rows of text columns; SQL NULL is rendered as
    /// the empty string.
    pub async fn fetch(&mut self, stmt: &str) -> Result<Vec<Vec<String>>> {
        let rows: Vec<Row> = self.conn.query(stmt).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(value_text).collect())
            .collect())
    }
}

impl std::fmt::Debug for SqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSession")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::NULL => String::new(),
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            if micros > 0 {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                )
            } else {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = u32::from(hours) + days * 24;
            if micros > 0 {
                format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
            } else {
                format!("{sign}{hours:02}:{minutes:02}:{seconds:02}")
            }
        }
    }
}

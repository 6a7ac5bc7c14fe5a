//! Forwarding of query events (DDL) to the sink over a plain SQL session.
//!
//! Statements are executed the way the primary ran them: switch to the
//! event's database, then issue the statement verbatim inside the
//! executor's open transaction.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::Server;
use crate::connection::SqlSession;
use crate::convert::quote_identifier;
use crate::error::Result;
use crate::event::ReplicationEvent;
use crate::processor::Processor;

/// Executes forwarded statements against the sink.
pub struct SqlExecutor {
    servers: Vec<Server>,
    engine: String,
    sql: Option<SqlSession>,
}

impl SqlExecutor {
    pub fn new(servers: Vec<Server>, engine: impl Into<String>) -> Self {
        Self {
            servers,
            engine: engine.into(),
            sql: None,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.sql.is_some() {
            return Ok(());
        }

        let mut session = SqlSession::connect(&self.servers).await?;

        // Forwarded DDL must land on the analytic engine, and commits are
        // driven by the transaction boundary, not per statement.
        let setup = [
            format!("SET default_storage_engine={}", self.engine),
            "SET autocommit=0".to_string(),
        ];
        session.execute_batch(&setup).await?;

        self.sql = Some(session);
        Ok(())
    }
}

#[async_trait]
impl Processor for SqlExecutor {
    async fn start_transaction(&mut self) -> Result<()> {
        self.connect().await.inspect_err(|err| {
            error!(error = %err, "failed to open DDL session");
        })
    }

    async fn process(&mut self, batch: Vec<ReplicationEvent>) -> Result<()> {
        let Some(session) = self.sql.as_mut() else {
            return Err(crate::error::ReplicationError::sink(
                "DDL session unavailable",
            ));
        };

        for event in batch {
            let ReplicationEvent::Query(query) = event else {
                warn!("non-query event in DDL queue");
                continue;
            };

            debug!(database = %query.database, statement = %query.statement, "forwarding DDL");

            let result = async {
                if !query.database.is_empty() {
                    session
                        .execute(&format!("USE {}", quote_identifier(&query.database)))
                        .await?;
                }
                session.execute(&query.statement).await
            }
            .await;

            if let Err(err) = result {
                error!(error = %err, statement = %query.statement, "DDL execution failed");
                self.sql = None;
                return Err(err);
            }
        }

        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        if let Some(session) = self.sql.as_mut() {
            session.execute("COMMIT").await?;
        }
        Ok(())
    }

    async fn rollback_transaction(&mut self) {
        if let Some(session) = self.sql.as_mut() {
            if session.execute("ROLLBACK").await.is_err() {
                // A session that cannot roll back is not worth keeping
                self.sql = None;
            }
        }
    }
}

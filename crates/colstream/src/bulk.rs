//! Bulk-insert driver seam.
//!
//! The analytic store's bulk API is expressed as a pair of fallible traits
//! so the rest of the pipeline never sees driver specifics. A bulk insert
//! competes with other writers for the sink's table-level lock, so it must
//! be committed before any DELETE/UPDATE touches the same table.
//!
//! [`SqlBulkDriver`] is the built-in implementation: rows are buffered and
//! turned into batched multi-row `INSERT` statements delivered through an
//! ordinary SQL session, committed as one transaction.

use async_trait::async_trait;
use tracing::debug;

use crate::config::Server;
use crate::connection::SqlSession;
use crate::convert::{quote_identifier, quote_string};
use crate::error::{ReplicationError, Result};

/// Rows per synthesized `INSERT` statement.
const ROWS_PER_STATEMENT: usize = 500;

/// One typed column value on its way into a bulk row.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkValue {
    Int(i64),
    Uint(u64),
    Double(f64),
    Text(String),
}

impl BulkValue {
    /// Render as a SQL literal.
    pub fn literal(&self) -> String {
        match self {
            BulkValue::Int(v) => v.to_string(),
            BulkValue::Uint(v) => v.to_string(),
            BulkValue::Double(v) => v.to_string(),
            BulkValue::Text(v) => quote_string(v),
        }
    }
}

/// An open bulk insert for one table.
#[async_trait]
pub trait BulkInsert: Send {
    fn set_column(&mut self, idx: usize, value: BulkValue) -> Result<()>;
    fn set_null(&mut self, idx: usize) -> Result<()>;
    fn write_row(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
}

/// Factory for bulk inserts against the sink.
#[async_trait]
pub trait BulkDriver: Send + Sync {
    async fn create_bulk_insert(&self, database: &str, table: &str) -> Result<Box<dyn BulkInsert>>;
}

/// Bulk driver that batches rows into multi-row `INSERT` statements.
pub struct SqlBulkDriver {
    sink: Server,
}

impl SqlBulkDriver {
    pub fn new(sink: Server) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl BulkDriver for SqlBulkDriver {
    async fn create_bulk_insert(&self, database: &str, table: &str) -> Result<Box<dyn BulkInsert>> {
        let session = SqlSession::connect_one(&self.sink).await?;
        debug!(database, table, "opened bulk insert");

        Ok(Box::new(SqlBulkInsert {
            session,
            database: database.to_string(),
            table: table.to_string(),
            current: Vec::new(),
            rows: Vec::new(),
        }))
    }
}

struct SqlBulkInsert {
    session: SqlSession,
    database: String,
    table: String,
    /// Literals of the row being assembled, indexed by column
    current: Vec<Option<String>>,
    /// Rendered `(v1, v2, ...)` tuples awaiting commit
    rows: Vec<String>,
}

impl SqlBulkInsert {
    fn set(&mut self, idx: usize, literal: String) {
        if self.current.len() <= idx {
            self.current.resize(idx + 1, None);
        }
        self.current[idx] = Some(literal);
    }
}

#[async_trait]
impl BulkInsert for SqlBulkInsert {
    fn set_column(&mut self, idx: usize, value: BulkValue) -> Result<()> {
        self.set(idx, value.literal());
        Ok(())
    }

    fn set_null(&mut self, idx: usize) -> Result<()> {
        self.set(idx, "NULL".to_string());
        Ok(())
    }

    fn write_row(&mut self) -> Result<()> {
        let tuple = render_tuple(&self.current);
        self.rows.push(tuple);
        self.current.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        let rows = std::mem::take(&mut self.rows);
        let count = rows.len();
        let statements = insert_statements(&self.database, &self.table, &rows);

        self.session
            .execute("BEGIN")
            .await
            .map_err(|e| ReplicationError::sink(e.to_string()))?;

        for stmt in &statements {
            if let Err(e) = self.session.execute(stmt).await {
                let _ = self.session.execute("ROLLBACK").await;
                return Err(ReplicationError::sink(e.to_string()));
            }
        }

        self.session
            .execute("COMMIT")
            .await
            .map_err(|e| ReplicationError::sink(e.to_string()))?;

        debug!(
            database = self.database,
            table = self.table,
            rows = count,
            "bulk insert committed"
        );
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.current.clear();
        self.rows.clear();
        Ok(())
    }
}

fn render_tuple(columns: &[Option<String>]) -> String {
    let literals: Vec<&str> = columns
        .iter()
        .map(|c| c.as_deref().unwrap_or("NULL"))
        .collect();
    format!("({})", literals.join(", "))
}

fn insert_statements(database: &str, table: &str, tuples: &[String]) -> Vec<String> {
    let target = format!("{}.{}", quote_identifier(database), quote_identifier(table));
    tuples
        .chunks(ROWS_PER_STATEMENT)
        .map(|chunk| format!("INSERT INTO {target} VALUES {}", chunk.join(", ")))
        .collect()
}

//! Per-table delivery of row events to the sink.
//!
//! A [`TableSink`] owns one table's schema snapshot and applies that
//! table's stream of row events: contiguous inserts go through the bulk
//! API, while deletes and updates fall back to synthesized SQL statements.
//! An open bulk insert holds the sink's table lock, so it is committed and
//! closed before any statement touches the same table.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::bulk::{BulkDriver, BulkInsert};
use crate::config::{Mode, Server};
use crate::connection::SqlSession;
use crate::convert::{quote_identifier, BulkConverter, SqlValueConverter};
use crate::decode::decode_row;
use crate::error::{ReplicationError, Result};
use crate::event::{ReplicationEvent, RowsEvent, RowsKind, TableMapEvent};
use crate::processor::Processor;
use std::sync::Arc;

/// Schema snapshot taken from the most recent table map event.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub database: String,
    pub table: String,
    pub column_count: usize,
    pub column_types: Vec<u8>,
    pub metadata: Bytes,
}

impl From<&TableMapEvent> for TableSchema {
    fn from(map: &TableMapEvent) -> Self {
        Self {
            database: map.database.clone(),
            table: map.table.clone(),
            column_count: map.column_count,
            column_types: map.column_types.clone(),
            metadata: map.metadata.clone(),
        }
    }
}

impl TableSchema {
    fn target(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.database),
            quote_identifier(&self.table)
        )
    }
}

/// One column of the sink-side schema, as reported by `DESCRIBE`.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_text: String,
    pub nullable: bool,
    pub extra: String,
}

/// The sink-side schema for one table.
///
/// Used only in SQL delivery to synthesize `WHERE` predicates and `SET`
/// lists; the bulk path is positional and needs no names.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Retrieve the descriptor by issuing a `DESCRIBE` against the sink.
    pub async fn load(session: &mut SqlSession, database: &str, table: &str) -> Result<Self> {
        let stmt = format!(
            "DESCRIBE {}.{}",
            quote_identifier(database),
            quote_identifier(table)
        );
        let rows = session.fetch(&stmt).await?;

        if rows.is_empty() {
            return Err(ReplicationError::schema(format!(
                "{database}.{table} has no columns at the sink"
            )));
        }

        let columns = rows
            .into_iter()
            .map(|row| {
                let mut fields = row.into_iter();
                let name = fields.next().unwrap_or_default();
                let type_text = fields.next().unwrap_or_default();
                let nullable = fields.next().unwrap_or_default().eq_ignore_ascii_case("yes");
                let extra = fields.nth(2).unwrap_or_default();
                ColumnDescriptor {
                    name,
                    type_text,
                    nullable,
                    extra,
                }
            })
            .collect();

        Ok(Self { columns })
    }
}

/// Applies one table's row events to the sink.
pub struct TableSink {
    schema: TableSchema,
    mode: Mode,
    sink: Server,
    driver: Arc<dyn BulkDriver>,
    bulk: Option<Box<dyn BulkInsert>>,
    sql: Option<SqlSession>,
    descriptor: Option<TableDescriptor>,
}

impl TableSink {
    pub fn new(schema: TableSchema, mode: Mode, sink: Server, driver: Arc<dyn BulkDriver>) -> Self {
        Self {
            schema,
            mode,
            sink,
            driver,
            bulk: None,
            sql: None,
            descriptor: None,
        }
    }

    /// Decode every row image of a rows event into the open bulk insert.
    ///
    /// For UPDATE events both images become appended rows; this is the
    /// TRANSFORM rendition where history is kept instead of rewritten.
    async fn bulk_rows(&mut self, rows: &RowsEvent) -> Result<()> {
        if self.bulk.is_none() {
            let bulk = self
                .driver
                .create_bulk_insert(&self.schema.database, &self.schema.table)
                .await?;
            self.bulk = Some(bulk);
        }
        let Some(bulk) = self.bulk.as_deref_mut() else {
            return Err(ReplicationError::sink("bulk insert unavailable"));
        };

        let schema = &self.schema;
        let mut converter = BulkConverter::new(bulk);
        let data = rows.row_data.as_ref();
        let mut pos = 0;

        while pos < data.len() {
            pos += decode_one(schema, &rows.column_bitmap, &data[pos..], &mut converter)?;

            if rows.kind == RowsKind::Update {
                let after_bitmap = rows
                    .update_bitmap
                    .as_deref()
                    .unwrap_or(&rows.column_bitmap);
                pos += decode_one(schema, after_bitmap, &data[pos..], &mut converter)?;
            }
        }

        Ok(())
    }

    /// Deliver DELETE/UPDATE events as SQL statements.
    async fn sql_rows(&mut self, rows: &RowsEvent) -> Result<()> {
        // The bulk insert holds the sink's table lock; release it first.
        if let Some(mut bulk) = self.bulk.take() {
            bulk.commit().await?;
        }

        if self.sql.is_none() {
            self.sql = Some(SqlSession::connect_one(&self.sink).await?);
        }
        if self.descriptor.is_none() {
            let Some(session) = self.sql.as_mut() else {
                return Err(ReplicationError::sink("sink session unavailable"));
            };
            let descriptor =
                TableDescriptor::load(session, &self.schema.database, &self.schema.table).await?;
            self.descriptor = Some(descriptor);
        }

        let (Some(session), Some(descriptor)) = (self.sql.as_mut(), self.descriptor.as_ref())
        else {
            return Err(ReplicationError::sink("sink session unavailable"));
        };

        let statements = synthesize_statements(&self.schema, descriptor, rows)?;
        if statements.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(statements.len() + 2);
        batch.push("BEGIN".to_string());
        batch.extend(statements);
        batch.push("COMMIT".to_string());

        if let Err(err) = session.execute_batch(&batch).await {
            let _ = session.execute("ROLLBACK").await;
            self.sql = None;
            return Err(err);
        }

        Ok(())
    }
}

#[async_trait]
impl Processor for TableSink {
    /// Nothing to do up front; a bulk insert or SQL transaction is opened
    /// lazily on the first row.
    async fn start_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    async fn process(&mut self, batch: Vec<ReplicationEvent>) -> Result<()> {
        for event in batch {
            let rows = match event {
                ReplicationEvent::Rows(rows) => rows,
                ReplicationEvent::TableMap(map) => {
                    // A fresh snapshot for this table id; the sink-side
                    // schema may have moved with it.
                    self.schema = TableSchema::from(&map);
                    self.descriptor = None;
                    continue;
                }
                other => {
                    warn!(table = %self.schema.table, event = ?other, "unroutable event in table queue");
                    continue;
                }
            };

            match (rows.kind, self.mode) {
                (RowsKind::Write, _) => self.bulk_rows(&rows).await?,
                (_, Mode::Transform) => self.bulk_rows(&rows).await?,
                (_, Mode::Replicate) => self.sql_rows(&rows).await?,
            }
        }

        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        if let Some(mut bulk) = self.bulk.take() {
            bulk.commit().await?;
            debug!(
                database = %self.schema.database,
                table = %self.schema.table,
                "table transaction committed"
            );
        }
        Ok(())
    }

    async fn rollback_transaction(&mut self) {
        if let Some(mut bulk) = self.bulk.take() {
            if let Err(err) = bulk.rollback().await {
                warn!(error = %err, "bulk rollback failed");
            }
        }
    }
}

fn decode_one(
    schema: &TableSchema,
    present: &[u8],
    data: &[u8],
    converter: &mut BulkConverter<'_>,
) -> Result<usize> {
    let consumed = decode_row(
        &schema.column_types,
        &schema.metadata,
        schema.column_count,
        present,
        data,
        converter,
    )?;
    use crate::decode::Converter;
    converter.write_row()?;
    Ok(consumed)
}

/// Synthesize `DELETE`/`UPDATE` statements for one rows event.
fn synthesize_statements(
    schema: &TableSchema,
    descriptor: &TableDescriptor,
    rows: &RowsEvent,
) -> Result<Vec<String>> {
    if descriptor.columns.len() < schema.column_count {
        return Err(ReplicationError::schema(format!(
            "{} has {} columns at the sink but {} in the row image",
            schema.target(),
            descriptor.columns.len(),
            schema.column_count
        )));
    }

    let data = rows.row_data.as_ref();
    let mut before = SqlValueConverter::new(schema.column_count);
    let mut after = SqlValueConverter::new(schema.column_count);
    let mut pos = 0;

    while pos < data.len() {
        pos += decode_sql(schema, &rows.column_bitmap, &data[pos..], &mut before)?;

        if rows.kind == RowsKind::Update {
            let bitmap = rows
                .update_bitmap
                .as_deref()
                .unwrap_or(&rows.column_bitmap);
            pos += decode_sql(schema, bitmap, &data[pos..], &mut after)?;
        }
    }

    let before_rows = before.into_rows();
    let after_rows = after.into_rows();
    let mut statements = Vec::with_capacity(before_rows.len());

    match rows.kind {
        RowsKind::Delete => {
            for row in &before_rows {
                statements.push(format!(
                    "DELETE FROM {} WHERE {} LIMIT 1",
                    schema.target(),
                    predicate(descriptor, row)
                ));
            }
        }
        RowsKind::Update => {
            for (old, new) in before_rows.iter().zip(after_rows.iter()) {
                statements.push(format!(
                    "UPDATE {} SET {} WHERE {} LIMIT 1",
                    schema.target(),
                    assignments(descriptor, new),
                    predicate(descriptor, old)
                ));
            }
        }
        RowsKind::Write => {}
    }

    Ok(statements)
}

fn decode_sql(
    schema: &TableSchema,
    present: &[u8],
    data: &[u8],
    converter: &mut SqlValueConverter,
) -> Result<usize> {
    use crate::decode::Converter;
    let consumed = decode_row(
        &schema.column_types,
        &schema.metadata,
        schema.column_count,
        present,
        data,
        converter,
    )?;
    converter.write_row()?;
    Ok(consumed)
}

/// Build the `WHERE` clause of one row, with `IS` for the `NULL` literal.
fn predicate(descriptor: &TableDescriptor, row: &[Option<String>]) -> String {
    let mut terms = Vec::new();
    for (column, literal) in descriptor.columns.iter().zip(row.iter()) {
        let Some(literal) = literal else { continue };
        let name = quote_identifier(&column.name);
        if literal == "NULL" {
            terms.push(format!("{name} IS NULL"));
        } else {
            terms.push(format!("{name} = {literal}"));
        }
    }
    terms.join(" AND ")
}

/// Build the `SET` list of one updated row.
fn assignments(descriptor: &TableDescriptor, row: &[Option<String>]) -> String {
    let mut terms = Vec::new();
    for (column, literal) in descriptor.columns.iter().zip(row.iter()) {
        let Some(literal) = literal else { continue };
        terms.push(format!("{} = {literal}", quote_identifier(&column.name)));
    }
    terms.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkValue;
    use crate::decode::ColumnType;
    use std::sync::Mutex;

    fn descriptor(names: &[&str]) -> TableDescriptor {
        TableDescriptor {
            columns: names
                .iter()
                .map(|name| ColumnDescriptor {
                    name: name.to_string(),
                    type_text: "int(11)".to_string(),
                    nullable: true,
                    extra: String::new(),
                })
                .collect(),
        }
    }

    fn single_long_schema() -> TableSchema {
        TableSchema {
            database: "s".to_string(),
            table: "t".to_string(),
            column_count: 1,
            column_types: vec![ColumnType::Long as u8],
            metadata: Bytes::new(),
        }
    }

    #[test]
    fn update_statement_synthesis() {
        // before = 10, after = 11
        let schema = single_long_schema();
        let rows = RowsEvent {
            kind: RowsKind::Update,
            table_id: 11,
            column_count: 1,
            column_bitmap: vec![0b1],
            update_bitmap: Some(vec![0b1]),
            row_data: Bytes::from_static(&[
                0x00, 0x0A, 0x00, 0x00, 0x00, // before image
                0x00, 0x0B, 0x00, 0x00, 0x00, // after image
            ]),
        };

        let statements = synthesize_statements(&schema, &descriptor(&["c0"]), &rows).unwrap();
        assert_eq!(
            statements,
            vec!["UPDATE `s`.`t` SET `c0` = 11 WHERE `c0` = 10 LIMIT 1"]
        );
    }

    #[test]
    fn delete_statement_uses_is_null_for_null_columns() {
        let schema = TableSchema {
            database: "s".to_string(),
            table: "t".to_string(),
            column_count: 2,
            column_types: vec![ColumnType::Long as u8, ColumnType::Long as u8],
            metadata: Bytes::new(),
        };
        let rows = RowsEvent {
            kind: RowsKind::Delete,
            table_id: 12,
            column_count: 2,
            column_bitmap: vec![0b11],
            update_bitmap: None,
            // second column NULL: only the first contributes body bytes
            row_data: Bytes::from_static(&[0b10, 0x07, 0x00, 0x00, 0x00]),
        };

        let statements = synthesize_statements(&schema, &descriptor(&["a", "b"]), &rows).unwrap();
        assert_eq!(
            statements,
            vec!["DELETE FROM `s`.`t` WHERE `a` = 7 AND `b` IS NULL LIMIT 1"]
        );
    }

    #[test]
    fn multiple_row_images_produce_multiple_statements() {
        let schema = single_long_schema();
        let rows = RowsEvent {
            kind: RowsKind::Delete,
            table_id: 12,
            column_count: 1,
            column_bitmap: vec![0b1],
            update_bitmap: None,
            row_data: Bytes::from_static(&[
                0x00, 0x01, 0x00, 0x00, 0x00, //
                0x00, 0x02, 0x00, 0x00, 0x00,
            ]),
        };

        let statements = synthesize_statements(&schema, &descriptor(&["id"]), &rows).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("`id` = 1"));
        assert!(statements[1].contains("`id` = 2"));
    }

    #[test]
    fn descriptor_narrower_than_row_image_is_a_schema_error() {
        let schema = TableSchema {
            database: "s".to_string(),
            table: "t".to_string(),
            column_count: 2,
            column_types: vec![ColumnType::Long as u8, ColumnType::Long as u8],
            metadata: Bytes::new(),
        };
        let rows = RowsEvent {
            kind: RowsKind::Delete,
            table_id: 12,
            column_count: 2,
            column_bitmap: vec![0b11],
            update_bitmap: None,
            row_data: Bytes::from_static(&[0b00, 1, 0, 0, 0, 2, 0, 0, 0]),
        };

        let err = synthesize_statements(&schema, &descriptor(&["only"]), &rows).unwrap_err();
        assert!(matches!(err, ReplicationError::Schema(_)));
    }

    // ------------------------------------------------------------------
    // Bulk path with a recording driver
    // ------------------------------------------------------------------

    #[derive(Debug, Default)]
    struct DriverJournal {
        opened: usize,
        rows: Vec<Vec<String>>,
        commits: usize,
        rollbacks: usize,
    }

    struct RecordingDriver {
        journal: Arc<Mutex<DriverJournal>>,
    }

    struct RecordingBulk {
        journal: Arc<Mutex<DriverJournal>>,
        current: Vec<String>,
    }

    #[async_trait]
    impl BulkDriver for RecordingDriver {
        async fn create_bulk_insert(
            &self,
            _database: &str,
            _table: &str,
        ) -> Result<Box<dyn BulkInsert>> {
            self.journal.lock().unwrap().opened += 1;
            Ok(Box::new(RecordingBulk {
                journal: self.journal.clone(),
                current: Vec::new(),
            }))
        }
    }

    #[async_trait]
    impl BulkInsert for RecordingBulk {
        fn set_column(&mut self, _idx: usize, value: BulkValue) -> Result<()> {
            self.current.push(value.literal());
            Ok(())
        }

        fn set_null(&mut self, _idx: usize) -> Result<()> {
            self.current.push("NULL".to_string());
            Ok(())
        }

        fn write_row(&mut self) -> Result<()> {
            let row = std::mem::take(&mut self.current);
            self.journal.lock().unwrap().rows.push(row);
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            self.journal.lock().unwrap().commits += 1;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.journal.lock().unwrap().rollbacks += 1;
            Ok(())
        }
    }

    fn write_event() -> ReplicationEvent {
        // (LONG, VARCHAR(64)) = (5, "abc")
        ReplicationEvent::Rows(RowsEvent {
            kind: RowsKind::Write,
            table_id: 10,
            column_count: 2,
            column_bitmap: vec![0b11],
            update_bitmap: None,
            row_data: Bytes::from_static(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c']),
        })
    }

    fn orders_schema() -> TableSchema {
        TableSchema {
            database: "shop".to_string(),
            table: "orders".to_string(),
            column_count: 2,
            column_types: vec![ColumnType::Long as u8, ColumnType::Varchar as u8],
            metadata: Bytes::from_static(&[64, 0]),
        }
    }

    #[tokio::test]
    async fn write_rows_feed_the_bulk_insert() {
        let journal = Arc::new(Mutex::new(DriverJournal::default()));
        let mut sink = TableSink::new(
            orders_schema(),
            Mode::Replicate,
            Server::new("sink", 3306),
            Arc::new(RecordingDriver {
                journal: journal.clone(),
            }),
        );

        sink.start_transaction().await.unwrap();
        sink.process(vec![write_event(), write_event()]).await.unwrap();
        sink.commit_transaction().await.unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.opened, 1);
        assert_eq!(journal.rows.len(), 2);
        assert_eq!(journal.rows[0], vec!["5", "'abc'"]);
        assert_eq!(journal.commits, 1);
    }

    #[tokio::test]
    async fn transform_mode_appends_both_update_images() {
        let journal = Arc::new(Mutex::new(DriverJournal::default()));
        let mut sink = TableSink::new(
            single_long_schema(),
            Mode::Transform,
            Server::new("sink", 3306),
            Arc::new(RecordingDriver {
                journal: journal.clone(),
            }),
        );

        let update = ReplicationEvent::Rows(RowsEvent {
            kind: RowsKind::Update,
            table_id: 11,
            column_count: 1,
            column_bitmap: vec![0b1],
            update_bitmap: Some(vec![0b1]),
            row_data: Bytes::from_static(&[
                0x00, 0x0A, 0x00, 0x00, 0x00, //
                0x00, 0x0B, 0x00, 0x00, 0x00,
            ]),
        });

        sink.process(vec![update]).await.unwrap();
        sink.commit_transaction().await.unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.rows, vec![vec!["10".to_string()], vec!["11".to_string()]]);
        assert_eq!(journal.commits, 1);
    }

    #[tokio::test]
    async fn rollback_closes_the_bulk_insert() {
        let journal = Arc::new(Mutex::new(DriverJournal::default()));
        let mut sink = TableSink::new(
            orders_schema(),
            Mode::Replicate,
            Server::new("sink", 3306),
            Arc::new(RecordingDriver {
                journal: journal.clone(),
            }),
        );

        sink.process(vec![write_event()]).await.unwrap();
        sink.rollback_transaction().await;

        let journal = journal.lock().unwrap();
        assert_eq!(journal.rollbacks, 1);
        assert_eq!(journal.commits, 0);
    }

    #[tokio::test]
    async fn commit_without_open_bulk_is_a_no_op() {
        let journal = Arc::new(Mutex::new(DriverJournal::default()));
        let mut sink = TableSink::new(
            orders_schema(),
            Mode::Replicate,
            Server::new("sink", 3306),
            Arc::new(RecordingDriver {
                journal: journal.clone(),
            }),
        );

        sink.commit_transaction().await.unwrap();
        assert_eq!(journal.lock().unwrap().commits, 0);
    }
}

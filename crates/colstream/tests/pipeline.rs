//! End-to-end pipeline tests over the public API: wire-format events are
//! parsed, routed through a worker, and delivered through a recording
//! bulk driver standing in for the analytic store.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colstream::bulk::{BulkDriver, BulkInsert, BulkValue};
use colstream::event::{EventParser, ReplicationEvent, RowsKind};
use colstream::table::{TableSchema, TableSink};
use colstream::{Mode, Server, State, Worker};

/// Ordered log of everything the sink saw.
#[derive(Debug, Clone, PartialEq)]
enum SinkOp {
    Open(String),
    Row(Vec<String>),
    Commit,
    Rollback,
}

#[derive(Default)]
struct RecordingDriver {
    log: Arc<Mutex<Vec<SinkOp>>>,
}

struct RecordingBulk {
    log: Arc<Mutex<Vec<SinkOp>>>,
    current: Vec<String>,
}

#[async_trait]
impl BulkDriver for RecordingDriver {
    async fn create_bulk_insert(
        &self,
        database: &str,
        table: &str,
    ) -> colstream::Result<Box<dyn BulkInsert>> {
        self.log
            .lock()
            .unwrap()
            .push(SinkOp::Open(format!("{database}.{table}")));
        Ok(Box::new(RecordingBulk {
            log: self.log.clone(),
            current: Vec::new(),
        }))
    }
}

#[async_trait]
impl BulkInsert for RecordingBulk {
    fn set_column(&mut self, _idx: usize, value: BulkValue) -> colstream::Result<()> {
        self.current.push(value.literal());
        Ok(())
    }

    fn set_null(&mut self, _idx: usize) -> colstream::Result<()> {
        self.current.push("NULL".to_string());
        Ok(())
    }

    fn write_row(&mut self) -> colstream::Result<()> {
        let row = std::mem::take(&mut self.current);
        self.log.lock().unwrap().push(SinkOp::Row(row));
        Ok(())
    }

    async fn commit(&mut self) -> colstream::Result<()> {
        self.log.lock().unwrap().push(SinkOp::Commit);
        Ok(())
    }

    async fn rollback(&mut self) -> colstream::Result<()> {
        self.log.lock().unwrap().push(SinkOp::Rollback);
        Ok(())
    }
}

/// Serialize a header + payload the way the primary frames events.
fn wire_event(event_type: u8, server_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    data.push(event_type);
    data.extend_from_slice(&server_id.to_le_bytes());
    data.extend_from_slice(&((19 + payload.len()) as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // next position
    data.extend_from_slice(&0u16.to_le_bytes()); // flags
    data.extend_from_slice(payload);
    data
}

fn orders_table_map() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&10u64.to_le_bytes()[..6]); // table id
    payload.extend_from_slice(&1u16.to_le_bytes()); // flags
    payload.push(4);
    payload.extend_from_slice(b"shop");
    payload.push(0);
    payload.push(6);
    payload.extend_from_slice(b"orders");
    payload.push(0);
    payload.push(2); // columns
    payload.extend_from_slice(&[3, 15]); // LONG, VARCHAR
    payload.push(2); // metadata length
    payload.extend_from_slice(&[64, 0]); // VARCHAR(64)
    payload.push(0b11); // nullability
    payload
}

fn orders_write_rows(id: u32, text: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&10u64.to_le_bytes()[..6]);
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.push(2); // column count
    payload.push(0b11); // column-present bitmap
    payload.push(0b00); // null bitmap
    payload.extend_from_slice(&id.to_le_bytes());
    payload.push(text.len() as u8);
    payload.extend_from_slice(text.as_bytes());
    payload
}

#[tokio::test]
async fn insert_transaction_reaches_the_sink_in_order() {
    let mut parser = EventParser::new();

    let map = parser
        .parse(&wire_event(19, 1, &orders_table_map()))
        .unwrap();
    let ReplicationEvent::TableMap(map) = map else {
        panic!("expected table map");
    };
    assert_eq!(map.database, "shop");
    assert_eq!(map.table, "orders");

    let driver = Arc::new(RecordingDriver::default());
    let log = driver.log.clone();

    let sink = TableSink::new(
        TableSchema::from(&map),
        Mode::Replicate,
        Server::new("sink", 3306),
        driver,
    );
    let worker = Worker::spawn(Box::new(sink), Duration::from_secs(60));

    for (id, text) in [(5, "abc"), (6, "def")] {
        let event = parser
            .parse(&wire_event(23, 1, &orders_write_rows(id, text)))
            .unwrap();
        let ReplicationEvent::Rows(ref rows) = event else {
            panic!("expected rows event");
        };
        assert_eq!(rows.kind, RowsKind::Write);
        assert_eq!(rows.table_id, 10);
        worker.enqueue(event);
    }

    // Transaction boundary: the reader fans out commit()
    assert!(worker.commit().await);
    assert_eq!(worker.state(), State::Idle);

    assert_eq!(
        log.lock().unwrap().clone(),
        vec![
            SinkOp::Open("shop.orders".to_string()),
            SinkOp::Row(vec!["5".to_string(), "'abc'".to_string()]),
            SinkOp::Row(vec!["6".to_string(), "'def'".to_string()]),
            SinkOp::Commit,
        ]
    );

    worker.shutdown().await;
}

#[tokio::test]
async fn each_transaction_opens_its_own_bulk_insert() {
    let mut parser = EventParser::new();
    let map = parser
        .parse(&wire_event(19, 1, &orders_table_map()))
        .unwrap();
    let ReplicationEvent::TableMap(map) = map else {
        panic!("expected table map");
    };

    let driver = Arc::new(RecordingDriver::default());
    let log = driver.log.clone();

    let sink = TableSink::new(
        TableSchema::from(&map),
        Mode::Replicate,
        Server::new("sink", 3306),
        driver,
    );
    let worker = Worker::spawn(Box::new(sink), Duration::from_secs(60));

    for text in ["first", "second"] {
        let event = parser
            .parse(&wire_event(23, 1, &orders_write_rows(1, text)))
            .unwrap();
        worker.enqueue(event);
        assert!(worker.commit().await);
    }

    let opens = log
        .lock()
        .unwrap()
        .iter()
        .filter(|op| matches!(op, SinkOp::Open(_)))
        .count();
    assert_eq!(opens, 2);

    worker.shutdown().await;
}

#[tokio::test]
async fn transform_mode_appends_deleted_rows() {
    let driver = Arc::new(RecordingDriver::default());
    let log = driver.log.clone();

    let schema = TableSchema {
        database: "s".to_string(),
        table: "t".to_string(),
        column_count: 1,
        column_types: vec![3], // LONG
        metadata: Bytes::new(),
    };
    let sink = TableSink::new(schema, Mode::Transform, Server::new("sink", 3306), driver);
    let worker = Worker::spawn(Box::new(sink), Duration::from_secs(60));

    // DELETE_ROWS with before image 9
    let mut payload = Vec::new();
    payload.extend_from_slice(&11u64.to_le_bytes()[..6]);
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.push(1);
    payload.push(0b1);
    payload.push(0b0);
    payload.extend_from_slice(&9u32.to_le_bytes());

    let mut parser = EventParser::new();
    let event = parser.parse(&wire_event(25, 1, &payload)).unwrap();
    worker.enqueue(event);

    assert!(worker.commit().await);
    assert_eq!(
        log.lock().unwrap().clone(),
        vec![
            SinkOp::Open("s.t".to_string()),
            SinkOp::Row(vec!["9".to_string()]),
            SinkOp::Commit,
        ]
    );

    worker.shutdown().await;
}

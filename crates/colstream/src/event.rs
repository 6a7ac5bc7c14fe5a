//! Binlog event model and wire-format parsing.
//!
//! Parses the MariaDB replication event stream into owned
//! [`ReplicationEvent`] values:
//! - GTID_EVENT (MariaDB form: sequence + domain)
//! - XID_EVENT (transaction commit)
//! - QUERY_EVENT (DDL / statements)
//! - TABLE_MAP_EVENT
//! - WRITE_ROWS / UPDATE_ROWS / DELETE_ROWS (v1 and v2)
//! - FORMAT_DESCRIPTION, ROTATE, HEARTBEAT (consumed internally)
//!
//! Row events carry their raw row images; the column values are unpacked
//! later against the table map by [`crate::decode`].

use bytes::{Buf, Bytes};
use std::io::{Cursor, Read};
use tracing::trace;

use crate::error::{ReplicationError, Result};

/// Binlog event type codes, including the MariaDB-specific range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    AnnotateRowsEvent = 160,
    BinlogCheckpointEvent = 161,
    GtidEvent = 162,
    GtidListEvent = 163,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            160 => EventType::AnnotateRowsEvent,
            161 => EventType::BinlogCheckpointEvent,
            162 => EventType::GtidEvent,
            163 => EventType::GtidListEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV1
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV1
                | EventType::DeleteRowsEventV2
        )
    }
}

/// The 19-byte header every binlog event starts with.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ReplicationError::protocol(format!(
                "event header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.get_u32_le();
        let event_type = EventType::from_u8(cursor.get_u8());
        let server_id = cursor.get_u32_le();
        let event_length = cursor.get_u32_le();
        let next_position = cursor.get_u32_le();
        let flags = cursor.get_u16_le();

        Ok(Self {
            timestamp,
            event_type,
            server_id,
            event_length,
            next_position,
            flags,
        })
    }
}

/// A MariaDB GTID event: one `domain-server-sequence` transaction identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidEvent {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence_nr: u64,
    pub flags: u8,
}

impl std::fmt::Display for GtidEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence_nr)
    }
}

/// A QUERY event: a statement executed on the primary, usually DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub database: String,
    pub statement: String,
}

/// Schema declaration for subsequent row events with the same table id.
///
/// Column types and the per-column metadata stream are kept raw; the row
/// decoder consumes them in lockstep with the row image.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub column_count: usize,
    pub column_types: Vec<u8>,
    pub metadata: Bytes,
}

/// Which kind of row change a rows event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// A rows event: one or more serialized row images for a single table.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub table_id: u64,
    pub column_count: usize,
    /// Which columns are present in each row image (LSB-first)
    pub column_bitmap: Vec<u8>,
    /// For UPDATE events, which columns are present in the after-image
    pub update_bitmap: Option<Vec<u8>>,
    /// The raw row images, back to back
    pub row_data: Bytes,
}

/// One decoded replication event, owning its backing data.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Gtid(GtidEvent),
    Xid(u64),
    Query(QueryEvent),
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    Rotate { position: u64, file: String },
    FormatDescription { checksum: bool },
    Heartbeat,
    Ignored(EventType),
}

/// Stateful parser for the event stream of one replication connection.
///
/// Tracks whether the primary appends CRC32 checksums to events, which is
/// advertised by the format description event at the head of each binlog.
#[derive(Debug, Default)]
pub struct EventParser {
    checksum: bool,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one event as received from the wire (header + payload).
    pub fn parse(&mut self, data: &[u8]) -> Result<ReplicationEvent> {
        let header = EventHeader::parse(data)?;
        let mut payload = &data[EventHeader::SIZE..];

        // The format description event describes its own checksum; for
        // everything else the trailer length is known up front.
        if self.checksum
            && header.event_type != EventType::FormatDescriptionEvent
            && payload.len() >= 4
        {
            payload = &payload[..payload.len() - 4];
        }

        trace!(
            event_type = ?header.event_type,
            payload_len = payload.len(),
            "parsing replication event"
        );

        match header.event_type {
            EventType::FormatDescriptionEvent => {
                self.checksum = format_description_has_checksum(payload);
                Ok(ReplicationEvent::FormatDescription {
                    checksum: self.checksum,
                })
            }
            EventType::GtidEvent => parse_gtid(payload, header.server_id),
            EventType::XidEvent => parse_xid(payload),
            EventType::QueryEvent => parse_query(payload),
            EventType::TableMapEvent => parse_table_map(payload),
            EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2 => {
                parse_rows(payload, RowsKind::Write, header.event_type)
            }
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2 => {
                parse_rows(payload, RowsKind::Update, header.event_type)
            }
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2 => {
                parse_rows(payload, RowsKind::Delete, header.event_type)
            }
            EventType::RotateEvent => parse_rotate(payload),
            EventType::HeartbeatLogEvent => Ok(ReplicationEvent::Heartbeat),
            other => Ok(ReplicationEvent::Ignored(other)),
        }
    }
}

/// The checksum algorithm byte sits five bytes from the end of the format
/// description payload when a CRC32 trailer follows, or last when not.
fn format_description_has_checksum(payload: &[u8]) -> bool {
    if payload.len() >= 5 && payload[payload.len() - 5] <= 1 {
        payload[payload.len() - 5] == 1
    } else {
        payload.last().copied() == Some(1)
    }
}

fn need(cursor: &Cursor<&[u8]>, n: usize, what: &str) -> Result<()> {
    if cursor.remaining() < n {
        return Err(ReplicationError::protocol(format!(
            "truncated event: {} more bytes needed for {what}",
            n - cursor.remaining()
        )));
    }
    Ok(())
}

fn parse_gtid(payload: &[u8], server_id: u32) -> Result<ReplicationEvent> {
    let mut cursor = Cursor::new(payload);
    need(&cursor, 13, "GTID event")?;

    let sequence_nr = cursor.get_u64_le();
    let domain_id = cursor.get_u32_le();
    let flags = cursor.get_u8();

    Ok(ReplicationEvent::Gtid(GtidEvent {
        domain_id,
        server_id,
        sequence_nr,
        flags,
    }))
}

fn parse_xid(payload: &[u8]) -> Result<ReplicationEvent> {
    let mut cursor = Cursor::new(payload);
    need(&cursor, 8, "XID event")?;
    Ok(ReplicationEvent::Xid(cursor.get_u64_le()))
}

fn parse_query(payload: &[u8]) -> Result<ReplicationEvent> {
    let mut cursor = Cursor::new(payload);
    need(&cursor, 13, "query event header")?;

    let _thread_id = cursor.get_u32_le();
    let _exec_time = cursor.get_u32_le();
    let schema_len = cursor.get_u8() as usize;
    let _error_code = cursor.get_u16_le();
    let status_vars_len = cursor.get_u16_le() as usize;

    need(&cursor, status_vars_len + schema_len + 1, "query event body")?;
    cursor.advance(status_vars_len);

    let mut schema_bytes = vec![0u8; schema_len];
    cursor.read_exact(&mut schema_bytes)?;
    let database = String::from_utf8_lossy(&schema_bytes).to_string();
    cursor.advance(1); // null terminator

    let mut statement_bytes = vec![0u8; cursor.remaining()];
    cursor.read_exact(&mut statement_bytes)?;
    let statement = String::from_utf8_lossy(&statement_bytes).to_string();

    Ok(ReplicationEvent::Query(QueryEvent {
        database,
        statement,
    }))
}

fn parse_table_map(payload: &[u8]) -> Result<ReplicationEvent> {
    let mut cursor = Cursor::new(payload);
    need(&cursor, 9, "table map header")?;

    let table_id = read_table_id(&mut cursor);
    let _flags = cursor.get_u16_le();

    need(&cursor, 1, "database name length")?;
    let db_len = cursor.get_u8() as usize;
    need(&cursor, db_len + 1, "database name")?;
    let mut db_bytes = vec![0u8; db_len];
    cursor.read_exact(&mut db_bytes)?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();
    cursor.advance(1); // null terminator

    need(&cursor, 1, "table name length")?;
    let table_len = cursor.get_u8() as usize;
    need(&cursor, table_len + 1, "table name")?;
    let mut table_bytes = vec![0u8; table_len];
    cursor.read_exact(&mut table_bytes)?;
    let table = String::from_utf8_lossy(&table_bytes).to_string();
    cursor.advance(1); // null terminator

    let column_count = read_packed_int(&mut cursor)? as usize;
    need(&cursor, column_count, "column types")?;
    let mut column_types = vec![0u8; column_count];
    cursor.read_exact(&mut column_types)?;

    let metadata_len = read_packed_int(&mut cursor)? as usize;
    need(&cursor, metadata_len, "column metadata")?;
    let mut metadata = vec![0u8; metadata_len];
    cursor.read_exact(&mut metadata)?;

    // The trailing null bitmap declares nullable columns; the row images
    // carry their own null bitmaps, so it is not retained.

    Ok(ReplicationEvent::TableMap(TableMapEvent {
        table_id,
        database,
        table,
        column_count,
        column_types,
        metadata: Bytes::from(metadata),
    }))
}

fn parse_rows(payload: &[u8], kind: RowsKind, event_type: EventType) -> Result<ReplicationEvent> {
    let mut cursor = Cursor::new(payload);
    need(&cursor, 9, "rows event header")?;

    let table_id = read_table_id(&mut cursor);
    let _flags = cursor.get_u16_le();

    // v2 events interpose a variable-length extra-data block
    if matches!(
        event_type,
        EventType::WriteRowsEventV2 | EventType::UpdateRowsEventV2 | EventType::DeleteRowsEventV2
    ) {
        need(&cursor, 2, "rows event extra data length")?;
        let extra_len = cursor.get_u16_le() as usize;
        if extra_len > 2 {
            need(&cursor, extra_len - 2, "rows event extra data")?;
            cursor.advance(extra_len - 2);
        }
    }

    let column_count = read_packed_int(&mut cursor)? as usize;
    let bitmap_len = column_count.div_ceil(8);

    need(&cursor, bitmap_len, "column-present bitmap")?;
    let mut column_bitmap = vec![0u8; bitmap_len];
    cursor.read_exact(&mut column_bitmap)?;

    let update_bitmap = if kind == RowsKind::Update {
        need(&cursor, bitmap_len, "column-update bitmap")?;
        let mut bitmap = vec![0u8; bitmap_len];
        cursor.read_exact(&mut bitmap)?;
        Some(bitmap)
    } else {
        None
    };

    let mut row_data = vec![0u8; cursor.remaining()];
    cursor.read_exact(&mut row_data)?;

    Ok(ReplicationEvent::Rows(RowsEvent {
        kind,
        table_id,
        column_count,
        column_bitmap,
        update_bitmap,
        row_data: Bytes::from(row_data),
    }))
}

fn parse_rotate(payload: &[u8]) -> Result<ReplicationEvent> {
    let mut cursor = Cursor::new(payload);
    need(&cursor, 8, "rotate event")?;

    let position = cursor.get_u64_le();
    let mut name_bytes = vec![0u8; cursor.remaining()];
    cursor.read_exact(&mut name_bytes)?;
    let file = String::from_utf8_lossy(&name_bytes)
        .trim_end_matches('\0')
        .to_string();

    Ok(ReplicationEvent::Rotate { position, file })
}

/// Table ids are 6-byte little-endian integers.
fn read_table_id(cursor: &mut Cursor<&[u8]>) -> u64 {
    let mut id = 0u64;
    for shift in 0..6 {
        id |= (cursor.get_u8() as u64) << (shift * 8);
    }
    id
}

/// Length-encoded integer as used for column counts.
fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    need(cursor, 1, "length-encoded integer")?;
    let first = cursor.get_u8();
    match first {
        0..=250 => Ok(first as u64),
        252 => {
            need(cursor, 2, "length-encoded integer")?;
            Ok(cursor.get_u16_le() as u64)
        }
        253 => {
            need(cursor, 3, "length-encoded integer")?;
            let mut value = 0u64;
            for shift in 0..3 {
                value |= (cursor.get_u8() as u64) << (shift * 8);
            }
            Ok(value)
        }
        254 => {
            need(cursor, 8, "length-encoded integer")?;
            Ok(cursor.get_u64_le())
        }
        other => Err(ReplicationError::protocol(format!(
            "invalid length-encoded integer prefix: {other}"
        ))),
    }
}

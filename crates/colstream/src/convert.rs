//! Converter implementations for the two delivery paths.
//!
//! [`BulkConverter`] feeds decoded values straight into an open bulk-insert
//! row. [`SqlValueConverter`] accumulates SQL literal strings for the
//! statement synthesis done by the table processor: integers and floats
//! unquoted, strings single-quoted, SQL NULL as the literal `NULL`.

use crate::bulk::{BulkInsert, BulkValue};
use crate::decode::Converter;
use crate::error::Result;

/// Quote a string value as a SQL literal.
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            '\0' => quoted.push_str("\\0"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote an identifier with backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Writes decoded columns into an open bulk-insert row.
pub struct BulkConverter<'a> {
    bulk: &'a mut dyn BulkInsert,
}

impl<'a> BulkConverter<'a> {
    pub fn new(bulk: &'a mut dyn BulkInsert) -> Self {
        Self { bulk }
    }
}

impl Converter for BulkConverter<'_> {
    fn set_null(&mut self, idx: usize) -> Result<()> {
        self.bulk.set_null(idx)
    }

    fn set_int(&mut self, idx: usize, value: i64) -> Result<()> {
        self.bulk.set_column(idx, BulkValue::Int(value))
    }

    fn set_uint(&mut self, idx: usize, value: u64) -> Result<()> {
        self.bulk.set_column(idx, BulkValue::Uint(value))
    }

    fn set_double(&mut self, idx: usize, value: f64) -> Result<()> {
        self.bulk.set_column(idx, BulkValue::Double(value))
    }

    fn set_string(&mut self, idx: usize, value: &str) -> Result<()> {
        self.bulk.set_column(idx, BulkValue::Text(value.to_string()))
    }

    fn write_row(&mut self) -> Result<()> {
        self.bulk.write_row()
    }
}

/// Accumulates one SQL literal per column, one literal row per row image.
///
/// Columns whose column-present bit was clear stay `None` and are skipped
/// when statements are synthesized.
#[derive(Debug)]
pub struct SqlValueConverter {
    column_count: usize,
    current: Vec<Option<String>>,
    rows: Vec<Vec<Option<String>>>,
}

impl SqlValueConverter {
    pub fn new(column_count: usize) -> Self {
        Self {
            column_count,
            current: vec![None; column_count],
            rows: Vec::new(),
        }
    }

    /// Completed literal rows, consuming the converter.
    pub fn into_rows(self) -> Vec<Vec<Option<String>>> {
        self.rows
    }

    fn set(&mut self, idx: usize, literal: String) -> Result<()> {
        if idx < self.column_count {
            self.current[idx] = Some(literal);
        }
        Ok(())
    }
}

impl Converter for SqlValueConverter {
    fn set_null(&mut self, idx: usize) -> Result<()> {
        self.set(idx, "NULL".to_string())
    }

    fn set_int(&mut self, idx: usize, value: i64) -> Result<()> {
        self.set(idx, value.to_string())
    }

    fn set_uint(&mut self, idx: usize, value: u64) -> Result<()> {
        self.set(idx, value.to_string())
    }

    fn set_double(&mut self, idx: usize, value: f64) -> Result<()> {
        self.set(idx, value.to_string())
    }

    fn set_string(&mut self, idx: usize, value: &str) -> Result<()> {
        self.set(idx, quote_string(value))
    }

    fn write_row(&mut self) -> Result<()> {
        let row = std::mem::replace(&mut self.current, vec![None; self.column_count]);
        self.rows.push(row);
        Ok(())
    }
}

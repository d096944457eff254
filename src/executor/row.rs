use std::convert::TryInto;

use crate::catalog::schema::{ColumnType, TableSchema};
use crate::error::{ErrorKind, SmallError};

/// One row as the executor passes it around: ordered
/// `(column name, value as text)` pairs.
///
/// The on-disk encoding is fixed-width per column (see [`encode_row`]),
/// so text is only the in-flight representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<(String, String)>,
}

impl Row {
    pub fn new(values: Vec<(String, String)>) -> Self {
        Self { values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn set(&mut self, column: &str, value: &str) -> bool {
        for (name, old) in self.values.iter_mut() {
            if name == column {
                *old = value.to_string();
                return true;
            }
        }
        false
    }

    pub fn texts(&self) -> Vec<String> {
        self.values.iter().map(|(_, v)| v.clone()).collect()
    }
}

fn type_error(column: &str, ctype: ColumnType, text: &str) -> SmallError {
    SmallError::new(
        ErrorKind::Semantic,
        &format!("value {:?} does not fit column {} ({})", text, column, ctype),
    )
}

/// Serialize one value into its fixed-width field.
pub fn encode_value(column: &str, ctype: ColumnType, text: &str) -> Result<Vec<u8>, SmallError> {
    match ctype {
        ColumnType::Int => {
            let v: i32 = text
                .trim()
                .parse()
                .map_err(|_| type_error(column, ctype, text))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ColumnType::BigInt => {
            let v: i64 = text
                .trim()
                .parse()
                .map_err(|_| type_error(column, ctype, text))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ColumnType::Double => {
            let v: f64 = text
                .trim()
                .parse()
                .map_err(|_| type_error(column, ctype, text))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ColumnType::Varchar(n) | ColumnType::Char(n) => {
            let bytes = text.as_bytes();
            if bytes.len() > n as usize {
                return Err(type_error(column, ctype, text));
            }
            let mut field = bytes.to_vec();
            field.resize(n as usize, 0);
            Ok(field)
        }
    }
}

/// Parse one fixed-width field back into text.
pub fn decode_value(ctype: ColumnType, bytes: &[u8]) -> String {
    match ctype {
        ColumnType::Int => i32::from_le_bytes(bytes.try_into().unwrap()).to_string(),
        ColumnType::BigInt => i64::from_le_bytes(bytes.try_into().unwrap()).to_string(),
        ColumnType::Double => format_double(f64::from_le_bytes(bytes.try_into().unwrap())),
        ColumnType::Varchar(_) | ColumnType::Char(_) => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
    }
}

fn format_double(v: f64) -> String {
    if v == v.trunc() && v.is_finite() && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

/// The canonical text for a value: the text it decodes back to after one
/// encode round trip. Used when comparing user input against stored
/// values ("01" and "1" are the same INT).
pub fn canonical_value(column: &str, ctype: ColumnType, text: &str) -> Result<String, SmallError> {
    let bytes = encode_value(column, ctype, text)?;
    Ok(decode_value(ctype, &bytes))
}

/// Serialize a full row, fields in schema column order.
pub fn encode_row(schema: &TableSchema, row: &Row) -> Result<Vec<u8>, SmallError> {
    let mut out = Vec::with_capacity(schema.row_size());
    for column in &schema.columns {
        let text = row.get(&column.name).ok_or_else(|| {
            SmallError::new(
                ErrorKind::Semantic,
                &format!("row is missing column {}", column.name),
            )
        })?;
        out.extend_from_slice(&encode_value(&column.name, column.ctype, text)?);
    }
    Ok(out)
}

/// Rebuild a row from its serialized form.
pub fn decode_row(schema: &TableSchema, bytes: &[u8]) -> Result<Row, SmallError> {
    if bytes.len() != schema.row_size() {
        return Err(SmallError::new(
            ErrorKind::InvalidParam,
            &format!(
                "record of {} bytes does not match schema of {} ({} bytes)",
                bytes.len(),
                schema.table_name,
                schema.row_size()
            ),
        ));
    }
    let mut values = Vec::with_capacity(schema.columns.len());
    let mut offset = 0;
    for column in &schema.columns {
        let size = column.ctype.size();
        let text = decode_value(column.ctype, &bytes[offset..offset + size]);
        values.push((column.name.clone(), text));
        offset += size;
    }
    Ok(Row::new(values))
}

use std::borrow::Cow;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::feature::{decode_text, AttrType, Value};
use crate::source::ByteSource;

const FIELD_DESCRIPTOR_SIZE: usize = 32;
const HEADER_TERMINATOR: u8 = 0x0d;

#[derive(Debug, Clone)]
pub struct DbfField {
    pub name: String,
    pub field_type: u8,
    pub length: usize,
    pub decimals: u8,
    offset: usize,
}

impl DbfField {
    pub fn attr_type(&self) -> AttrType {
        match self.field_type {
            b'L' => AttrType::Bool,
            b'N' | b'O' | b'F' => {
                if self.decimals > 0 {
                    AttrType::Double
                } else {
                    AttrType::Integer
                }
            }
            _ => AttrType::Text,
        }
    }
}

/// dBASE III attribute table: fixed-size records addressed by index, one
/// fixed-width cell per field.
pub struct DbfFile {
    source: ByteSource,
    fields: Vec<DbfField>,
    num_records: u32,
    header_len: usize,
    record_len: usize,
}

impl DbfFile {
    pub fn open(path: &Path) -> Result<Self> {
        let source = ByteSource::open(path)?;
        let head = source
            .read(0, 32)
            .map_err(|_| Error::MalformedFile("dbf header shorter than 32 bytes".into()))?;
        let num_records = LittleEndian::read_u32(&head[4..8]);
        let header_len = LittleEndian::read_u16(&head[8..10]) as usize;
        let record_len = LittleEndian::read_u16(&head[10..12]) as usize;
        if header_len < 33 || record_len == 0 {
            return Err(Error::MalformedFile("dbf header is inconsistent".into()));
        }

        let descriptors = source
            .read(32, header_len.saturating_sub(32))
            .map_err(|_| Error::MalformedFile("dbf field descriptors truncated".into()))?;
        let mut fields = Vec::new();
        // Record layout starts after the deletion flag.
        let mut offset = 1usize;
        for chunk in descriptors.chunks(FIELD_DESCRIPTOR_SIZE) {
            if chunk.is_empty() || chunk[0] == HEADER_TERMINATOR {
                break;
            }
            if chunk.len() < FIELD_DESCRIPTOR_SIZE {
                return Err(Error::MalformedFile("dbf field descriptor truncated".into()));
            }
            let name_end = chunk[..11].iter().position(|&b| b == 0).unwrap_or(11);
            let name = String::from_utf8_lossy(&chunk[..name_end]).trim().to_string();
            let length = chunk[16] as usize;
            fields.push(DbfField {
                name,
                field_type: chunk[11],
                length,
                decimals: chunk[17],
                offset,
            });
            offset += length;
        }
        if offset > record_len {
            return Err(Error::MalformedFile(
                "dbf fields exceed the declared record length".into(),
            ));
        }
        Ok(DbfFile {
            source,
            fields,
            num_records,
            header_len,
            record_len,
        })
    }

    pub fn fields(&self) -> &[DbfField] {
        &self.fields
    }

    pub fn num_records(&self) -> u32 {
        self.num_records
    }

    /// Raw bytes of record `index` (0-based), deletion flag included.
    pub fn record(&self, index: u32) -> Result<Cow<'_, [u8]>> {
        if index >= self.num_records {
            return Err(Error::MalformedFile(format!(
                "dbf record {index} out of range ({} records)",
                self.num_records
            )));
        }
        let pos = self.header_len as u64 + u64::from(index) * self.record_len as u64;
        self.source
            .read(pos, self.record_len)
            .map_err(|_| Error::MalformedFile(format!("dbf record {index} truncated")))
    }

    /// Converts one cell. Character and date fields decode as text through
    /// the datasource encoding; logicals map `T/t/Y/y/1` to true and `?` to
    /// null; numerics pick integer or double by the decimal count, with `*`
    /// fill meaning null.
    pub fn value(&self, record: &[u8], field_index: usize, encoding: &str) -> Value {
        let field = &self.fields[field_index];
        let raw = &record[field.offset..field.offset + field.length];
        let text = decode_text(raw, encoding);
        let trimmed = text.trim();
        match field.field_type {
            b'C' | b'D' | b'M' => Value::Text(trimmed.to_string()),
            b'L' => match trimmed.bytes().next() {
                Some(b'T') | Some(b't') | Some(b'Y') | Some(b'y') | Some(b'1') => Value::Bool(true),
                Some(b'?') | None => Value::Null,
                _ => Value::Bool(false),
            },
            b'N' | b'O' | b'F' => {
                if trimmed.is_empty() || trimmed.starts_with('*') {
                    return Value::Null;
                }
                if field.decimals > 0 {
                    trimmed.parse::<f64>().map(Value::Double).unwrap_or(Value::Null)
                } else {
                    trimmed.parse::<i64>().map(Value::Integer).unwrap_or(Value::Null)
                }
            }
            _ => Value::Text(trimmed.to_string()),
        }
    }
}

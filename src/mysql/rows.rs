use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

use super::protocol::{
    read_lenenc_bytes_slice, write_lenenc_bytes, FieldType, NULL_VALUE, OK_PACKET,
};
use super::value::{decode_binary_value, Value};

/// Immutable column descriptor as read from a column-definition packet.
#[derive(Debug, Clone)]
pub struct Field {
    pub database: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
    pub default_value: Option<Bytes>,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            database: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: super::protocol::UTF8_GENERAL_CI as u16,
            column_length: 255,
            field_type,
            flags: 0,
            decimals: 0,
            default_value: None,
        }
    }
}

/// The descriptor list a result's rows refer back to.
#[derive(Debug)]
pub struct ResultSet {
    pub columns: Vec<Field>,
    column_names: std::sync::OnceLock<Vec<String>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Field>) -> Arc<Self> {
        Arc::new(Self {
            columns,
            column_names: std::sync::OnceLock::new(),
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column display names, `table.column` qualified when the descriptor
    /// carries a table. Computed once.
    pub fn column_names(&self) -> &[String] {
        self.column_names.get_or_init(|| {
            self.columns
                .iter()
                .map(|f| {
                    if f.table.is_empty() {
                        f.name.clone()
                    } else {
                        format!("{}.{}", f.table, f.name)
                    }
                })
                .collect()
        })
    }
}

/// A row as raw payload bytes plus its owning descriptor list. Payloads
/// are reference-counted; composers pass them along without copying.
#[derive(Debug, Clone)]
pub enum Row {
    Text(TextRow),
    Binary(BinaryRow),
}

impl Row {
    pub fn result_set(&self) -> &Arc<ResultSet> {
        match self {
            Row::Text(r) => &r.result_set,
            Row::Binary(r) => &r.result_set,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Row::Text(r) => &r.content,
            Row::Binary(r) => &r.content,
        }
    }

    pub fn decode(&self) -> Result<Vec<Value>> {
        match self {
            Row::Text(r) => r.decode(),
            Row::Binary(r) => r.decode(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextRow {
    pub content: Bytes,
    pub result_set: Arc<ResultSet>,
}

impl TextRow {
    pub fn new(content: Bytes, result_set: Arc<ResultSet>) -> Self {
        Self {
            content,
            result_set,
        }
    }

    /// Builds a text row payload from values. The inverse of `decode`.
    pub fn encode(values: &[Value], result_set: Arc<ResultSet>) -> Self {
        let mut buf = BytesMut::new();
        for value in values {
            match value.to_text() {
                Some(raw) => write_lenenc_bytes(&mut buf, &raw),
                None => buf.put_u8(NULL_VALUE),
            }
        }
        Self {
            content: buf.freeze(),
            result_set,
        }
    }

    pub fn decode(&self) -> Result<Vec<Value>> {
        let columns = &self.result_set.columns;
        let mut dest = Vec::with_capacity(columns.len());
        let mut pos = 0usize;

        for field in columns {
            let (raw, is_null, n) =
                read_lenenc_bytes_slice(&self.content[pos..]).ok_or_else(|| {
                    ProxyError::ProtocolFraming(format!(
                        "text row truncated at column {}",
                        field.name
                    ))
                })?;
            pos += n;
            if is_null {
                dest.push(Value::Null);
            } else {
                dest.push(Value::Bytes(raw.to_vec()));
            }
        }
        Ok(dest)
    }

    /// Byte length of the first `n` column values; used to trim hidden
    /// trailing sort columns without re-encoding the row.
    pub fn prefix_len(&self, n: usize) -> Result<usize> {
        let mut pos = 0usize;
        for _ in 0..n {
            let (_, _, consumed) =
                read_lenenc_bytes_slice(&self.content[pos..]).ok_or_else(|| {
                    ProxyError::ProtocolFraming("text row truncated while trimming".to_string())
                })?;
            pos += consumed;
        }
        Ok(pos)
    }
}

#[derive(Debug, Clone)]
pub struct BinaryRow {
    pub content: Bytes,
    pub result_set: Arc<ResultSet>,
}

impl BinaryRow {
    pub fn new(content: Bytes, result_set: Arc<ResultSet>) -> Self {
        Self {
            content,
            result_set,
        }
    }

    /// Builds a binary row payload: 0x00 marker, null bitmap, values.
    pub fn encode(values: &[Value], result_set: Arc<ResultSet>) -> Result<Self> {
        let column_count = result_set.column_count();
        let bitmap_len = (column_count + 7 + 2) >> 3;
        let mut buf = BytesMut::new();
        buf.put_u8(OK_PACKET);
        buf.put_bytes(0, bitmap_len);

        for (i, value) in values.iter().enumerate() {
            if value.is_null() {
                let bit = i + 2;
                buf[1 + (bit >> 3)] |= 1 << (bit & 7);
                continue;
            }
            let field = &result_set.columns[i];
            super::value::encode_binary_value(&mut buf, field.field_type, value)?;
        }
        Ok(Self {
            content: buf.freeze(),
            result_set,
        })
    }

    pub fn decode(&self) -> Result<Vec<Value>> {
        let columns = &self.result_set.columns;
        if self.content.first() != Some(&OK_PACKET) {
            return Err(ProxyError::ProtocolFraming(
                "binary row missing 0x00 marker".to_string(),
            ));
        }

        // null bitmap: (column-count + 7 + 2) / 8 bytes at offset 1
        let bitmap_len = (columns.len() + 7 + 2) >> 3;
        if self.content.len() < 1 + bitmap_len {
            return Err(ProxyError::ProtocolFraming(
                "binary row shorter than its null bitmap".to_string(),
            ));
        }
        let null_mask = &self.content[1..1 + bitmap_len];
        let mut pos = 1 + bitmap_len;

        let mut dest = Vec::with_capacity(columns.len());
        for (i, field) in columns.iter().enumerate() {
            let bit = i + 2;
            if (null_mask[bit >> 3] >> (bit & 7)) & 1 == 1 {
                dest.push(Value::Null);
                continue;
            }
            let (value, n) = decode_binary_value(
                &self.content[pos..],
                field.field_type,
                field.flags,
                field.decimals,
            )?;
            pos += n;
            dest.push(value);
        }
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::protocol::UNSIGNED_FLAG;

    fn fields(specs: &[(&str, FieldType)]) -> Arc<ResultSet> {
        ResultSet::new(specs.iter().map(|(n, t)| Field::new(n, *t)).collect())
    }

    #[test]
    fn text_row_round_trip() {
        let rs = fields(&[
            ("id", FieldType::LongLong),
            ("name", FieldType::VarChar),
            ("age", FieldType::Long),
        ]);
        let values = vec![
            Value::Int(7),
            Value::Null,
            Value::Bytes(b"18".to_vec()),
        ];
        let row = TextRow::encode(&values, rs);
        let decoded = row.decode().unwrap();
        assert_eq!(decoded[0], Value::Bytes(b"7".to_vec()));
        assert_eq!(decoded[1], Value::Null);
        assert_eq!(decoded[2], Value::Bytes(b"18".to_vec()));
    }

    #[test]
    fn text_row_prefix_len_trims_trailing_columns() {
        let rs = fields(&[("a", FieldType::VarChar), ("b", FieldType::VarChar)]);
        let row = TextRow::encode(
            &[Value::from_str("xy"), Value::from_str("hidden")],
            rs.clone(),
        );
        let keep = row.prefix_len(1).unwrap();
        let trimmed = TextRow::new(row.content.slice(..keep), fields(&[("a", FieldType::VarChar)]));
        let decoded = trimmed.decode().unwrap();
        assert_eq!(decoded, vec![Value::Bytes(b"xy".to_vec())]);
    }

    #[test]
    fn binary_row_round_trip() {
        let rs = fields(&[
            ("id", FieldType::Long),
            ("name", FieldType::VarString),
            ("score", FieldType::Double),
        ]);
        let values = vec![
            Value::Int(-10),
            Value::Bytes(b"foo".to_vec()),
            Value::Double(2.5),
        ];
        let row = BinaryRow::encode(&values, rs).unwrap();
        assert_eq!(row.decode().unwrap(), values);
    }

    #[test]
    fn binary_null_bitmap_uses_offset_two() {
        let rs = fields(&[
            ("a", FieldType::Long),
            ("b", FieldType::Long),
            ("c", FieldType::Long),
        ]);
        let values = vec![Value::Null, Value::Int(1), Value::Null];
        let row = BinaryRow::encode(&values, rs).unwrap();

        // columns 0 and 2 are null: bits 2 and 4 of the first bitmap byte
        assert_eq!(row.content[0], 0x00);
        assert_eq!(row.content[1], (1 << 2) | (1 << 4));
        assert_eq!(row.decode().unwrap(), values);
    }

    #[test]
    fn binary_bitmap_exactly_covers_nulls() {
        // 9 columns spills the bitmap into a second byte
        let specs: Vec<(String, FieldType)> = (0..9)
            .map(|i| (format!("c{}", i), FieldType::Long))
            .collect();
        let rs = ResultSet::new(
            specs
                .iter()
                .map(|(n, t)| Field::new(n, *t))
                .collect::<Vec<_>>(),
        );
        let values: Vec<Value> = (0..9)
            .map(|i| if i % 2 == 0 { Value::Null } else { Value::Int(i) })
            .collect();
        let row = BinaryRow::encode(&values, rs).unwrap();
        let decoded = row.decode().unwrap();
        for (i, v) in decoded.iter().enumerate() {
            assert_eq!(v.is_null(), i % 2 == 0, "column {}", i);
        }
    }

    #[test]
    fn binary_row_rejects_bad_marker() {
        let rs = fields(&[("a", FieldType::Long)]);
        let row = BinaryRow::new(Bytes::from_static(&[0x01, 0x00, 1, 0, 0, 0]), rs);
        assert!(row.decode().is_err());
    }

    #[test]
    fn binary_unsigned_flag_respected() {
        let mut columns = vec![Field::new("n", FieldType::Tiny)];
        columns[0].flags = UNSIGNED_FLAG;
        let rs = ResultSet::new(columns);
        let row = BinaryRow::encode(&[Value::Int(250)], rs).unwrap();
        assert_eq!(row.decode().unwrap(), vec![Value::Int(250)]);
    }

    #[test]
    fn row_variants_share_one_decode_surface() {
        let rs = fields(&[("id", FieldType::Long), ("name", FieldType::VarChar)]);
        let values = vec![Value::Int(1), Value::Bytes(b"x".to_vec())];

        let text = Row::Text(TextRow::encode(&values, rs.clone()));
        let binary = Row::Binary(BinaryRow::encode(&values, rs).unwrap());
        assert_eq!(text.decode().unwrap().len(), 2);
        assert_eq!(binary.decode().unwrap(), values);
        assert_eq!(text.result_set().column_count(), 2);
        assert!(!text.payload().is_empty());
    }

    #[test]
    fn column_names_qualify_with_table() {
        let mut a = Field::new("id", FieldType::Long);
        a.table = "student".to_string();
        let b = Field::new("uid", FieldType::Long);
        let rs = ResultSet::new(vec![a, b]);
        assert_eq!(rs.column_names(), &["student.id".to_string(), "uid".to_string()]);
    }
}

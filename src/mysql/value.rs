use bytes::{BufMut, BytesMut};

use crate::error::{ProxyError, Result};

use super::protocol::{
    read_lenenc_bytes_slice, write_lenenc_bytes, FieldType, UNSIGNED_FLAG,
};

/// A single column value as carried through the proxy. Temporal values
/// stay in their text form; the proxy never needs calendar arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn from_str(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(raw) => std::str::from_utf8(raw).ok(),
            _ => None,
        }
    }

    /// Integer view used by shard-key evaluation.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bytes(raw) => std::str::from_utf8(raw).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Renders the value as a SQL literal for client-side placeholder
    /// interpolation.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Double(v) => {
                if v.is_finite() {
                    format!("{}", v)
                } else {
                    "NULL".to_string()
                }
            }
            Value::Bytes(raw) => {
                let mut out = String::with_capacity(raw.len() + 2);
                out.push('\'');
                for &b in raw {
                    match b {
                        b'\'' => out.push_str("\\'"),
                        b'\\' => out.push_str("\\\\"),
                        0 => out.push_str("\\0"),
                        b'\n' => out.push_str("\\n"),
                        b'\r' => out.push_str("\\r"),
                        0x1a => out.push_str("\\Z"),
                        _ => out.push(b as char),
                    }
                }
                out.push('\'');
                out
            }
        }
    }

    /// Text-protocol form (the bytes placed in a text row).
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string().into_bytes()),
            Value::UInt(v) => Some(v.to_string().into_bytes()),
            Value::Double(v) => Some(format!("{}", v).into_bytes()),
            Value::Bytes(raw) => Some(raw.clone()),
        }
    }
}

/// Decodes one binary-protocol value. `flags` carries the column's
/// UNSIGNED bit, `decimals` its declared fraction width. Returns the value
/// and the number of bytes consumed.
pub fn decode_binary_value(
    data: &[u8],
    field_type: FieldType,
    flags: u16,
    decimals: u8,
) -> Result<(Value, usize)> {
    let unsigned = flags & UNSIGNED_FLAG != 0;
    let truncated = || ProxyError::ProtocolFraming(format!("truncated {:?} value", field_type));

    match field_type {
        FieldType::Null => Ok((Value::Null, 0)),

        FieldType::Tiny => {
            let raw = *data.first().ok_or_else(truncated)?;
            let value = if unsigned {
                Value::Int(raw as i64)
            } else {
                Value::Int(raw as i8 as i64)
            };
            Ok((value, 1))
        }

        FieldType::Short | FieldType::Year => {
            if data.len() < 2 {
                return Err(truncated());
            }
            let raw = u16::from_le_bytes([data[0], data[1]]);
            let value = if unsigned {
                Value::Int(raw as i64)
            } else {
                Value::Int(raw as i16 as i64)
            };
            Ok((value, 2))
        }

        FieldType::Int24 | FieldType::Long => {
            if data.len() < 4 {
                return Err(truncated());
            }
            let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let value = if unsigned {
                Value::Int(raw as i64)
            } else {
                Value::Int(raw as i32 as i64)
            };
            Ok((value, 4))
        }

        FieldType::LongLong => {
            if data.len() < 8 {
                return Err(truncated());
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[..8]);
            let value = if unsigned {
                let v = u64::from_le_bytes(raw);
                if v > i64::MAX as u64 {
                    // beyond i64 range: carry as a decimal string
                    Value::Bytes(v.to_string().into_bytes())
                } else {
                    Value::Int(v as i64)
                }
            } else {
                Value::Int(i64::from_le_bytes(raw))
            };
            Ok((value, 8))
        }

        FieldType::Float => {
            if data.len() < 4 {
                return Err(truncated());
            }
            let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            Ok((Value::Double(f32::from_bits(raw) as f64), 4))
        }

        FieldType::Double => {
            if data.len() < 8 {
                return Err(truncated());
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[..8]);
            Ok((Value::Double(f64::from_bits(u64::from_le_bytes(raw))), 8))
        }

        FieldType::Decimal
        | FieldType::NewDecimal
        | FieldType::VarChar
        | FieldType::Bit
        | FieldType::Enum
        | FieldType::Set
        | FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::VarString
        | FieldType::String
        | FieldType::Geometry
        | FieldType::Json => {
            let (raw, is_null, n) = read_lenenc_bytes_slice(data).ok_or_else(truncated)?;
            if is_null {
                Ok((Value::Null, n))
            } else {
                Ok((Value::Bytes(raw.to_vec()), n))
            }
        }

        FieldType::Date | FieldType::NewDate | FieldType::DateTime | FieldType::Timestamp => {
            let len = *data.first().ok_or_else(truncated)? as usize;
            if data.len() < 1 + len {
                return Err(truncated());
            }
            let is_date = matches!(field_type, FieldType::Date | FieldType::NewDate);
            let text = format_binary_datetime(&data[1..1 + len], is_date, decimals)?;
            Ok((Value::Bytes(text.into_bytes()), 1 + len))
        }

        FieldType::Time => {
            let len = *data.first().ok_or_else(truncated)? as usize;
            if data.len() < 1 + len {
                return Err(truncated());
            }
            let text = format_binary_time(&data[1..1 + len], decimals)?;
            Ok((Value::Bytes(text.into_bytes()), 1 + len))
        }
    }
}

/// Encodes one value in binary-protocol layout. The inverse of
/// `decode_binary_value` for the numeric and string families.
pub fn encode_binary_value(buf: &mut BytesMut, field_type: FieldType, value: &Value) -> Result<()> {
    let mismatch = || {
        ProxyError::ProtocolFraming(format!(
            "cannot encode {:?} as {:?}",
            value, field_type
        ))
    };

    match field_type {
        FieldType::Tiny => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            buf.put_u8(v as u8);
        }
        FieldType::Short | FieldType::Year => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            buf.put_u16_le(v as u16);
        }
        FieldType::Int24 | FieldType::Long => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            buf.put_u32_le(v as u32);
        }
        FieldType::LongLong => match value {
            Value::Int(v) => buf.put_u64_le(*v as u64),
            Value::UInt(v) => buf.put_u64_le(*v),
            Value::Bytes(raw) => {
                let v: u64 = std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(mismatch)?;
                buf.put_u64_le(v);
            }
            _ => return Err(mismatch()),
        },
        FieldType::Float => match value {
            Value::Double(v) => buf.put_u32_le((*v as f32).to_bits()),
            _ => return Err(mismatch()),
        },
        FieldType::Double => match value {
            Value::Double(v) => buf.put_u64_le(v.to_bits()),
            _ => return Err(mismatch()),
        },
        FieldType::Decimal
        | FieldType::NewDecimal
        | FieldType::VarChar
        | FieldType::Bit
        | FieldType::Enum
        | FieldType::Set
        | FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::VarString
        | FieldType::String
        | FieldType::Geometry
        | FieldType::Json => match value {
            Value::Bytes(raw) => write_lenenc_bytes(buf, raw),
            other => {
                let text = other.to_text().ok_or_else(mismatch)?;
                write_lenenc_bytes(buf, &text);
            }
        },
        _ => return Err(mismatch()),
    }
    Ok(())
}

/// Binary TIME payload (length byte already stripped): is-negative(1),
/// days(4 LE), hours, minutes, seconds, optional microseconds(4 LE).
/// Zero length means 00:00:00. A `decimals` of 0x1f is treated as 0.
pub fn format_binary_time(data: &[u8], decimals: u8) -> Result<String> {
    let frac_digits = match decimals {
        0x00 | 0x1f => 0,
        d @ 1..=6 => d as usize,
        d => {
            return Err(ProxyError::ProtocolFraming(format!(
                "illegal decimals value {}",
                d
            )))
        }
    };

    if data.is_empty() {
        return Ok(match frac_digits {
            0 => "00:00:00".to_string(),
            d => format!("00:00:00.{:0<width$}", "", width = d),
        });
    }
    if data.len() != 8 && data.len() != 12 {
        return Err(ProxyError::ProtocolFraming(format!(
            "invalid TIME payload length {}",
            data.len()
        )));
    }

    let negative = data[0] != 0;
    let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as u64;
    let hours = days * 24 + data[5] as u64;
    let minutes = data[6];
    let seconds = data[7];

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));

    if frac_digits > 0 {
        let micros = if data.len() == 12 {
            u32::from_le_bytes([data[8], data[9], data[10], data[11]])
        } else {
            0
        };
        let full = format!("{:06}", micros);
        out.push('.');
        out.push_str(&full[..frac_digits]);
    }
    Ok(out)
}

/// Binary DATE/DATETIME/TIMESTAMP payload (length byte stripped):
/// year(2 LE), month, day, then optionally hour, minute, second and
/// microseconds(4 LE). Zero length is the zero date.
pub fn format_binary_datetime(data: &[u8], is_date: bool, decimals: u8) -> Result<String> {
    let frac_digits = if is_date {
        0
    } else {
        match decimals {
            0x00 | 0x1f => 0,
            d @ 1..=6 => d as usize,
            d => {
                return Err(ProxyError::ProtocolFraming(format!(
                    "illegal decimals value {}",
                    d
                )))
            }
        }
    };

    let (year, month, day, hour, minute, second, micros) = match data.len() {
        0 => (0, 0, 0, 0, 0, 0, 0),
        4 => (
            u16::from_le_bytes([data[0], data[1]]),
            data[2],
            data[3],
            0,
            0,
            0,
            0,
        ),
        7 => (
            u16::from_le_bytes([data[0], data[1]]),
            data[2],
            data[3],
            data[4],
            data[5],
            data[6],
            0,
        ),
        11 => (
            u16::from_le_bytes([data[0], data[1]]),
            data[2],
            data[3],
            data[4],
            data[5],
            data[6],
            u32::from_le_bytes([data[7], data[8], data[9], data[10]]),
        ),
        n => {
            return Err(ProxyError::ProtocolFraming(format!(
                "invalid DATETIME payload length {}",
                n
            )))
        }
    };

    let mut out = format!("{:04}-{:02}-{:02}", year, month, day);
    if is_date {
        return Ok(out);
    }
    out.push_str(&format!(" {:02}:{:02}:{:02}", hour, minute, second));
    if frac_digits > 0 {
        let full = format!("{:06}", micros);
        out.push('.');
        out.push_str(&full[..frac_digits]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(field_type: FieldType, flags: u16, value: Value) {
        let mut buf = BytesMut::new();
        encode_binary_value(&mut buf, field_type, &value).unwrap();
        let (decoded, n) = decode_binary_value(&buf, field_type, flags, 0).unwrap();
        assert_eq!(decoded, value, "{:?}", field_type);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn numeric_round_trips() {
        round_trip(FieldType::Tiny, 0, Value::Int(-5));
        round_trip(FieldType::Tiny, UNSIGNED_FLAG, Value::Int(200));
        round_trip(FieldType::Short, 0, Value::Int(-12345));
        round_trip(FieldType::Year, UNSIGNED_FLAG, Value::Int(2024));
        round_trip(FieldType::Long, 0, Value::Int(-7_000_000));
        round_trip(FieldType::Long, UNSIGNED_FLAG, Value::Int(3_000_000_000));
        round_trip(FieldType::LongLong, 0, Value::Int(i64::MIN));
        round_trip(FieldType::Double, 0, Value::Double(3.25));
    }

    #[test]
    fn float_round_trip() {
        let mut buf = BytesMut::new();
        encode_binary_value(&mut buf, FieldType::Float, &Value::Double(1.5)).unwrap();
        let (decoded, _) = decode_binary_value(&buf, FieldType::Float, 0, 0).unwrap();
        assert_eq!(decoded, Value::Double(1.5));
    }

    #[test]
    fn string_family_round_trips() {
        for ft in [
            FieldType::VarChar,
            FieldType::VarString,
            FieldType::String,
            FieldType::Blob,
            FieldType::NewDecimal,
            FieldType::Json,
        ] {
            round_trip(ft, 0, Value::Bytes(b"hello world".to_vec()));
        }
    }

    #[test]
    fn unsigned_longlong_max_becomes_decimal_string() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(u64::MAX);
        let (decoded, _) =
            decode_binary_value(&buf, FieldType::LongLong, UNSIGNED_FLAG, 0).unwrap();
        assert_eq!(decoded, Value::Bytes(b"18446744073709551615".to_vec()));
    }

    #[test]
    fn unsigned_longlong_in_range_stays_integer() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(42);
        let (decoded, _) =
            decode_binary_value(&buf, FieldType::LongLong, UNSIGNED_FLAG, 0).unwrap();
        assert_eq!(decoded, Value::Int(42));
    }

    #[test]
    fn time_zero_length_is_midnight() {
        assert_eq!(format_binary_time(&[], 0).unwrap(), "00:00:00");
    }

    #[test]
    fn time_decimals_0x1f_formats_like_zero() {
        let payload = [0u8, 1, 0, 0, 0, 2, 30, 45]; // 1 day, 02:30:45
        let plain = format_binary_time(&payload, 0).unwrap();
        let scaled = format_binary_time(&payload, 0x1f).unwrap();
        assert_eq!(plain, scaled);
        assert_eq!(plain, "26:30:45");
    }

    #[test]
    fn time_with_microseconds() {
        let mut payload = vec![1u8, 0, 0, 0, 0, 0, 0, 1];
        payload.extend_from_slice(&123456u32.to_le_bytes());
        assert_eq!(format_binary_time(&payload, 6).unwrap(), "-00:00:01.123456");
        assert_eq!(format_binary_time(&payload, 3).unwrap(), "-00:00:01.123");
    }

    #[test]
    fn datetime_layouts() {
        assert_eq!(
            format_binary_datetime(&[], false, 0).unwrap(),
            "0000-00-00 00:00:00"
        );
        let ymd = [0xe8, 0x07, 2, 14]; // 2024-02-14
        assert_eq!(format_binary_datetime(&ymd, true, 0).unwrap(), "2024-02-14");
        let full = [0xe8, 0x07, 2, 14, 10, 30, 59];
        assert_eq!(
            format_binary_datetime(&full, false, 0).unwrap(),
            "2024-02-14 10:30:59"
        );
        let mut with_us = full.to_vec();
        with_us.extend_from_slice(&7000u32.to_le_bytes());
        assert_eq!(
            format_binary_datetime(&with_us, false, 6).unwrap(),
            "2024-02-14 10:30:59.007000"
        );
    }

    #[test]
    fn sql_literal_escaping() {
        assert_eq!(Value::Null.to_sql_literal(), "NULL");
        assert_eq!(Value::Int(-3).to_sql_literal(), "-3");
        assert_eq!(
            Value::Bytes(b"it's".to_vec()).to_sql_literal(),
            "'it\\'s'"
        );
        assert_eq!(
            Value::Bytes(b"a\\b".to_vec()).to_sql_literal(),
            "'a\\\\b'"
        );
    }
}

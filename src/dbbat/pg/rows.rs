use std::convert::TryInto;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::dbbat::common::Result;
use crate::dbbat::pg::protocol::{FieldDescription, FormatCode, Message, Tag};

// Type OIDs from pg_type.dat for the types we decode specially.
pub const OID_BOOL: i32 = 16;
pub const OID_BYTEA: i32 = 17;
pub const OID_INT8: i32 = 20;
pub const OID_INT2: i32 = 21;
pub const OID_INT4: i32 = 23;
pub const OID_OID: i32 = 26;
pub const OID_JSON: i32 = 114;
pub const OID_FLOAT4: i32 = 700;
pub const OID_FLOAT8: i32 = 701;
pub const OID_NUMERIC: i32 = 1700;
pub const OID_UUID: i32 = 2950;
pub const OID_JSONB: i32 = 3802;

/// The column values of one DataRow message. Values borrow from the message;
/// None is SQL NULL.
pub struct DataRowValues<'a> {
    pub values: Vec<Option<&'a [u8]>>,
    /// sum of the value byte lengths, the row's contribution to bytes_transferred
    pub total_bytes: u64,
}

pub fn split_data_row(msg: &Message) -> Result<DataRowValues> {
    debug_assert_eq!(msg.tag(), Tag::DATA_ROW);
    let mut r = msg.reader();
    let num_fields = r.read_i16();
    let mut values = Vec::with_capacity(num_fields.max(0) as usize);
    let mut total_bytes = 0u64;
    for _ in 0..num_fields {
        let len = r.read_i32();
        if len < 0 {
            values.push(None); // null
        } else {
            let bytes = r.read_bytes(len as u32)?;
            total_bytes += len as u64;
            values.push(Some(bytes));
        }
    }
    r.error()?;
    Ok(DataRowValues {
        values,
        total_bytes,
    })
}

/// Decode a raw column value into its canonical JSON representation (number,
/// boolean, string, bytea-as-string, null) using the column's type OID and
/// format code. Values we cannot make sense of degrade to strings, never to
/// errors; capture must not break relaying.
pub fn decode_value(field: &FieldDescription, raw: Option<&[u8]>) -> Value {
    let bytes = match raw {
        None => return Value::Null,
        Some(b) => b,
    };
    match field.format {
        FormatCode::Text => decode_text_value(field.type_oid, bytes),
        FormatCode::Binary => decode_binary_value(field.type_oid, bytes),
    }
}

fn decode_text_value(type_oid: i32, bytes: &[u8]) -> Value {
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => return Value::String(BASE64.encode(bytes)),
    };
    match type_oid {
        OID_BOOL => Value::Bool(text == "t"),
        OID_INT2 | OID_INT4 | OID_INT8 | OID_OID => match text.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(text.to_string()),
        },
        OID_FLOAT4 | OID_FLOAT8 | OID_NUMERIC => match text.parse::<f64>() {
            // NaN/Infinity have no JSON number form; keep them as strings
            Ok(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(text.to_string())),
            Err(_) => Value::String(text.to_string()),
        },
        // bytea arrives as "\x..." hex; keep it verbatim
        _ => Value::String(text.to_string()),
    }
}

fn decode_binary_value(type_oid: i32, bytes: &[u8]) -> Value {
    match (type_oid, bytes.len()) {
        (OID_BOOL, 1) => Value::Bool(bytes[0] != 0),
        (OID_INT2, 2) => Value::Number(i16::from_be_bytes(bytes.try_into().unwrap()).into()),
        (OID_INT4, 4) => Value::Number(i32::from_be_bytes(bytes.try_into().unwrap()).into()),
        (OID_INT8, 8) => Value::Number(i64::from_be_bytes(bytes.try_into().unwrap()).into()),
        (OID_OID, 4) => Value::Number(u32::from_be_bytes(bytes.try_into().unwrap()).into()),
        (OID_FLOAT4, 4) => {
            let f = f32::from_be_bytes(bytes.try_into().unwrap());
            serde_json::Number::from_f64(f as f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string()))
        }
        (OID_FLOAT8, 8) => {
            let f = f64::from_be_bytes(bytes.try_into().unwrap());
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string()))
        }
        (OID_UUID, 16) => {
            let bytes: [u8; 16] = bytes.try_into().unwrap();
            Value::String(uuid::Uuid::from_bytes(bytes).to_string())
        }
        (OID_BYTEA, _) => Value::String(format!("\\x{}", hex::encode(bytes))),
        (OID_JSON, _) | (OID_JSONB, _) => {
            // jsonb has a one-byte version prefix
            let body = if type_oid == OID_JSONB && bytes.first() == Some(&1) {
                &bytes[1..]
            } else {
                bytes
            };
            match std::str::from_utf8(body) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => Value::String(BASE64.encode(bytes)),
            }
        }
        _ => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::String(BASE64.encode(bytes)),
        },
    }
}

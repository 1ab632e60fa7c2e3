use serde_json::json;

use crate::dbbat::pg::protocol::{FieldDescription, FormatCode, MessageBuilder, Tag};
use crate::dbbat::pg::rows::{decode_value, split_data_row};
use crate::dbbat::pg::sql::{CopyDirection, CopyFormat};
use crate::dbbat::pg::{CaptureLimits, Intercept};

fn limits(max_rows: u64, max_bytes: u64) -> CaptureLimits {
    CaptureLimits {
        store_results: true,
        max_result_rows: max_rows,
        max_result_bytes: max_bytes,
    }
}

fn data_row(values: &[Option<&str>]) -> crate::dbbat::pg::protocol::Message {
    let mut mb = MessageBuilder::new(Tag::DATA_ROW);
    mb.write_i16(values.len() as i16);
    for value in values {
        match value {
            None => mb.write_i32(-1),
            Some(v) => {
                mb.write_i32(v.len() as i32);
                mb.write_bytes(v.as_bytes());
            }
        }
    }
    mb.finish()
}

fn text_field(name: &str, oid: i32) -> FieldDescription {
    FieldDescription {
        name: name.to_string(),
        type_oid: oid,
        format: FormatCode::Text,
    }
}

#[test]
fn test_split_data_row_counts_value_bytes() {
    let msg = data_row(&[Some("abcd"), None, Some("xy")]);
    let split = split_data_row(&msg).unwrap();
    assert_eq!(split.values.len(), 3);
    assert_eq!(split.values[0], Some(&b"abcd"[..]));
    assert_eq!(split.values[1], None);
    assert_eq!(split.total_bytes, 6);
}

#[test]
fn test_decode_text_values() {
    assert_eq!(decode_value(&text_field("b", 16), Some(b"t")), json!(true));
    assert_eq!(decode_value(&text_field("b", 16), Some(b"f")), json!(false));
    assert_eq!(decode_value(&text_field("n", 23), Some(b"42")), json!(42));
    assert_eq!(decode_value(&text_field("n", 20), Some(b"-7")), json!(-7));
    assert_eq!(
        decode_value(&text_field("f", 701), Some(b"1.5")),
        json!(1.5)
    );
    assert_eq!(
        decode_value(&text_field("f", 701), Some(b"NaN")),
        json!("NaN")
    );
    assert_eq!(
        decode_value(&text_field("s", 25), Some(b"hello")),
        json!("hello")
    );
    assert_eq!(decode_value(&text_field("s", 25), None), json!(null));
    // bytea text format stays verbatim
    assert_eq!(
        decode_value(&text_field("raw", 17), Some(b"\\x01ff")),
        json!("\\x01ff")
    );
}

#[test]
fn test_decode_binary_values() {
    let bin = |name: &str, oid: i32| FieldDescription {
        name: name.to_string(),
        type_oid: oid,
        format: FormatCode::Binary,
    };
    assert_eq!(decode_value(&bin("b", 16), Some(&[1])), json!(true));
    assert_eq!(
        decode_value(&bin("n", 23), Some(&42i32.to_be_bytes())),
        json!(42)
    );
    assert_eq!(
        decode_value(&bin("n", 20), Some(&(-7i64).to_be_bytes())),
        json!(-7)
    );
    assert_eq!(
        decode_value(&bin("f", 701), Some(&1.5f64.to_be_bytes())),
        json!(1.5)
    );
    assert_eq!(
        decode_value(&bin("raw", 17), Some(&[1, 255])),
        json!("\\x01ff")
    );
    let uuid_bytes = [0u8; 16];
    assert_eq!(
        decode_value(&bin("u", 2950), Some(&uuid_bytes)),
        json!("00000000-0000-0000-0000-000000000000")
    );
}

fn fields_one_text_col() -> Vec<FieldDescription> {
    vec![text_field("v", 25)]
}

#[test]
fn test_capture_within_limits() {
    let mut intercept = Intercept::new();
    intercept.begin_simple("SELECT v FROM t".to_string());
    intercept.on_row_description(fields_one_text_col());
    let limits = limits(10, 1000);
    for i in 0..3 {
        let value = format!("row{}", i);
        intercept
            .on_data_row(&data_row(&[Some(&value)]), &limits)
            .unwrap();
    }
    intercept.on_command_complete("SELECT 3");
    let finished = intercept.take_finished();
    assert_eq!(finished.len(), 1);
    let (query, rows) = finished.into_iter().next().unwrap().finish();
    assert!(!query.truncated);
    assert_eq!(query.rows_affected, Some(3));
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].row_number, 0);
    assert_eq!(rows[2].row_number, 2);
    assert_eq!(rows[0].row_data.get("v"), Some(&json!("row0")));
    assert_eq!(query.data_bytes, 12);
}

#[test]
fn test_row_limit_truncation_is_all_or_nothing() {
    let mut intercept = Intercept::new();
    intercept.begin_simple("SELECT v FROM t".to_string());
    intercept.on_row_description(fields_one_text_col());
    let limits = limits(2, 1000);
    for _ in 0..5 {
        intercept
            .on_data_row(&data_row(&[Some("abcde")]), &limits)
            .unwrap();
    }
    intercept.on_command_complete("SELECT 5");
    let (query, rows) = intercept
        .take_finished()
        .into_iter()
        .next()
        .unwrap()
        .finish();
    assert!(query.truncated);
    // never a partial slice
    assert_eq!(rows.len(), 0);
    // bytes still account for every relayed row
    assert_eq!(query.data_bytes, 25);
}

#[test]
fn test_byte_limit_truncation() {
    let mut intercept = Intercept::new();
    intercept.begin_simple("SELECT v FROM t".to_string());
    intercept.on_row_description(fields_one_text_col());
    let limits = limits(1000, 10);
    for _ in 0..4 {
        intercept
            .on_data_row(&data_row(&[Some("abcd")]), &limits)
            .unwrap();
    }
    let (query, rows) = intercept
        .take_finished()
        .into_iter()
        .next()
        .unwrap()
        .finish();
    assert!(query.truncated);
    assert_eq!(rows.len(), 0);
    assert_eq!(query.data_bytes, 16);
}

#[test]
fn test_store_results_disabled_still_counts_bytes() {
    let mut intercept = Intercept::new();
    intercept.begin_simple("SELECT v FROM t".to_string());
    intercept.on_row_description(fields_one_text_col());
    let limits = CaptureLimits {
        store_results: false,
        max_result_rows: 1000,
        max_result_bytes: 1000,
    };
    intercept
        .on_data_row(&data_row(&[Some("abcd")]), &limits)
        .unwrap();
    let (query, rows) = intercept
        .take_finished()
        .into_iter()
        .next()
        .unwrap()
        .finish();
    assert!(!query.truncated);
    assert_eq!(rows.len(), 0);
    assert_eq!(query.data_bytes, 4);
}

#[test]
fn test_extended_queue_fifo() {
    let mut intercept = Intercept::new();
    intercept.begin_execute("SELECT $1".to_string(), Default::default());
    intercept.begin_execute("SELECT $2".to_string(), Default::default());
    intercept.on_row_description(fields_one_text_col());
    intercept
        .on_data_row(&data_row(&[Some("first")]), &limits(10, 1000))
        .unwrap();
    intercept.on_command_complete("SELECT 1");
    intercept.on_row_description(fields_one_text_col());
    intercept
        .on_data_row(&data_row(&[Some("second")]), &limits(10, 1000))
        .unwrap();
    intercept.on_command_complete("SELECT 1");

    let finished = intercept.take_finished();
    assert_eq!(finished.len(), 2);
    let mut finished = finished.into_iter();
    let (q1, rows1) = finished.next().unwrap().finish();
    assert_eq!(q1.sql_text, "SELECT $1");
    assert_eq!(rows1[0].row_data.get("v"), Some(&json!("first")));
    let (q2, rows2) = finished.next().unwrap().finish();
    assert_eq!(q2.sql_text, "SELECT $2");
    assert_eq!(rows2[0].row_data.get("v"), Some(&json!("second")));
}

#[test]
fn test_error_settles_pending_query() {
    let mut intercept = Intercept::new();
    intercept.begin_simple("SELECT broken".to_string());
    let err = crate::dbbat::pg::protocol::PostgresError {
        severity: "ERROR".to_string(),
        code: "42703".to_string(),
        message: "column \"broken\" does not exist".to_string(),
    };
    intercept.on_error(&err);
    let (query, rows) = intercept
        .take_finished()
        .into_iter()
        .next()
        .unwrap()
        .finish();
    assert_eq!(query.error.as_deref(), Some("column \"broken\" does not exist"));
    assert!(rows.is_empty());
}

#[test]
fn test_copy_capture_rows() {
    let mut intercept = Intercept::new();
    intercept.begin_simple("COPY t (a, b) TO STDOUT".to_string());
    intercept.on_copy_response(CopyDirection::Out, false);
    let limits = limits(10, 1000);
    intercept.on_copy_data(b"x\t1\n", false, &limits);
    intercept.on_copy_data(b"y\t2\n", false, &limits);
    // client-direction chunks are ignored for a COPY OUT
    intercept.on_copy_data(b"zzz\n", true, &limits);
    intercept.on_copy_done();
    intercept.on_command_complete("COPY 2");

    let (query, rows) = intercept
        .take_finished()
        .into_iter()
        .next()
        .unwrap()
        .finish();
    assert_eq!(query.copy_direction, Some(CopyDirection::Out));
    assert_eq!(query.copy_format, Some(CopyFormat::Text));
    assert_eq!(query.rows_affected, Some(2));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].row_data.get("data"), Some(&json!("x\t1")));
    assert_eq!(rows[1].row_data.get("data"), Some(&json!("y\t2")));
}

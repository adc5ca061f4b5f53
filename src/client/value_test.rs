use bytes::BytesMut;
use tokio_postgres::types::FromSql;
use tokio_postgres::types::IsNull;
use tokio_postgres::types::ToSql;
use tokio_postgres::types::Type;

use super::value::decode_numeric;
use super::value::encode_numeric;
use super::*;

/// Binary numeric as the server sends it.
fn numeric_wire(
    weight: i16,
    sign: u16,
    dscale: u16,
    digits: &[u16],
) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
    raw.extend_from_slice(&weight.to_be_bytes());
    raw.extend_from_slice(&sign.to_be_bytes());
    raw.extend_from_slice(&dscale.to_be_bytes());
    for d in digits {
        raw.extend_from_slice(&d.to_be_bytes());
    }
    raw
}

#[test]
fn test_decode_numeric_keeps_exact_digits() {
    // 12345.678
    assert_eq!(decode_numeric(&numeric_wire(1, 0x0000, 3, &[1, 2345, 6780])).unwrap(), "12345.678");
    // -0.05
    assert_eq!(decode_numeric(&numeric_wire(-1, 0x4000, 2, &[500])).unwrap(), "-0.05");
    // 0.00005
    assert_eq!(decode_numeric(&numeric_wire(-2, 0x0000, 5, &[5000])).unwrap(), "0.00005");
    // 10000 has a trailing zero group stripped by the server
    assert_eq!(decode_numeric(&numeric_wire(1, 0x0000, 0, &[1])).unwrap(), "10000");
    // 0.000 with no digits at all
    assert_eq!(decode_numeric(&numeric_wire(0, 0x0000, 3, &[])).unwrap(), "0.000");
    assert_eq!(decode_numeric(&numeric_wire(0, 0xC000, 0, &[])).unwrap(), "NaN");
}

#[test]
fn test_decode_numeric_rejects_truncated_input() {
    assert!(decode_numeric(&[0, 1, 0]).is_err());
    let mut raw = numeric_wire(0, 0x0000, 0, &[1, 2]);
    raw.pop();
    assert!(decode_numeric(&raw).is_err());
}

#[test]
fn test_encode_numeric_matches_server_layout() {
    let mut out = BytesMut::new();
    encode_numeric("-12345.678", &mut out).unwrap();
    assert_eq!(out.as_ref(), numeric_wire(1, 0x4000, 3, &[1, 2345, 6780]).as_slice());

    let mut out = BytesMut::new();
    encode_numeric("0.0500", &mut out).unwrap();
    assert_eq!(out.as_ref(), numeric_wire(-1, 0x0000, 4, &[500]).as_slice());
    assert_eq!(decode_numeric(&out).unwrap(), "0.0500");

    let mut out = BytesMut::new();
    encode_numeric("-0.00", &mut out).unwrap();
    assert_eq!(out.as_ref(), numeric_wire(0, 0x0000, 2, &[]).as_slice());

    let mut out = BytesMut::new();
    encode_numeric("Infinity", &mut out).unwrap();
    assert_eq!(decode_numeric(&out).unwrap(), "Infinity");

    let mut out = BytesMut::new();
    assert!(encode_numeric("12a", &mut out).is_err());
    assert!(encode_numeric(".", &mut out).is_err());
}

#[test]
fn test_from_sql_by_type() {
    assert_eq!(Value::from_sql(&Type::BOOL, &[1]).unwrap(), Value::Bool(true));
    assert_eq!(Value::from_sql(&Type::INT2, &7i16.to_be_bytes()).unwrap(), Value::Int(7));
    assert_eq!(Value::from_sql(&Type::INT4, &(-3i32).to_be_bytes()).unwrap(), Value::Int(-3));
    assert_eq!(Value::from_sql(&Type::INT8, &(1i64 << 40).to_be_bytes()).unwrap(), Value::Int(1 << 40));
    assert_eq!(Value::from_sql(&Type::FLOAT8, &1.5f64.to_be_bytes()).unwrap(), Value::Float(1.5));
    assert_eq!(Value::from_sql(&Type::TEXT, b"hello").unwrap(), Value::Text("hello".into()));
    assert_eq!(Value::from_sql(&Type::BYTEA, &[0xde, 0xad]).unwrap(), Value::Bytes(vec![0xde, 0xad]));
    assert_eq!(
        Value::from_sql(&Type::PG_LSN, &0x0000_0001_0000_00A0u64.to_be_bytes()).unwrap(),
        Value::Text("1/A0".into())
    );
    assert_eq!(Value::from_sql(&Type::JSONB, b"\x01{}").unwrap(), Value::Text("{}".into()));
    assert_eq!(Value::from_sql_null(&Type::INT4).unwrap(), Value::Null);
}

#[test]
fn test_to_sql_narrows_integers() {
    let mut out = BytesMut::new();
    assert!(matches!(Value::Int(5).to_sql(&Type::INT4, &mut out).unwrap(), IsNull::No));
    assert_eq!(out.as_ref(), &5i32.to_be_bytes());

    let mut out = BytesMut::new();
    assert!(Value::Int(1 << 40).to_sql(&Type::INT4, &mut out).is_err());

    let mut out = BytesMut::new();
    assert!(matches!(Value::Null.to_sql(&Type::TEXT, &mut out).unwrap(), IsNull::Yes));
}

#[test]
fn test_to_sql_rejects_mismatched_type() {
    let mut out = BytesMut::new();
    assert!(Value::Bytes(vec![1]).to_sql(&Type::INT4, &mut out).is_err());
    assert!(Value::Text("x".into()).to_sql(&Type::BOOL, &mut out).is_err());
}

#[test]
fn test_display_and_conversions() {
    assert_eq!(Value::from(3).to_string(), "3");
    assert_eq!(Value::from("abc").to_string(), "abc");
    assert_eq!(Value::from(None::<i64>), Value::Null);
    assert_eq!(Value::Bytes(vec![0x0a, 0xff]).to_string(), "\\x0aff");
    assert_eq!(Value::Numeric("1.50".into()).as_f64(), Some(1.5));
    assert_eq!(Value::Bool(true).as_bool(), Some(true));
    assert_eq!(Value::Int(1).as_bool(), None);
}

#[test]
fn test_query_result_shape() {
    let empty = QueryResult::default();
    assert!(!empty.has_result_set());
    assert_eq!(empty.scalar(), None);

    let one = QueryResult {
        columns: vec!["?column?".into()],
        rows: vec![vec![Value::Int(1)]],
    };
    assert!(one.has_result_set());
    assert_eq!(one.scalar(), Some(&Value::Int(1)));
}

use std::error::Error as StdError;
use std::fmt;

use bytes::BufMut;
use bytes::BytesMut;
use tokio_postgres::types::to_sql_checked;
use tokio_postgres::types::FromSql;
use tokio_postgres::types::IsNull;
use tokio_postgres::types::ToSql;
use tokio_postgres::types::Type;

type BoxError = Box<dyn StdError + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// One row of a query result.
pub type Row = Vec<Value>;

/// A single query parameter or result cell.
///
/// `numeric` round-trips exactly through [`Value::Numeric`]; types without a
/// dedicated variant decode to [`Value::Bytes`] holding the binary wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Numeric(n) => n.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Numeric(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Numeric(s) | Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => {
                write!(f, "\\x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn is_text(ty: &Type) -> bool {
    *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME || *ty == Type::UNKNOWN
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    i.to_sql(ty, out)
                } else if *ty == Type::OID {
                    u32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    encode_numeric(&i.to_string(), out)
                } else if is_text(ty) {
                    i.to_string().as_str().to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            Value::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    v.to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    encode_numeric(&v.to_string(), out)
                } else if is_text(ty) {
                    v.to_string().as_str().to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            Value::Numeric(s) => {
                if *ty == Type::NUMERIC {
                    encode_numeric(s, out)
                } else if is_text(ty) {
                    s.as_str().to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            Value::Text(s) => {
                if is_text(ty) || *ty == Type::JSON {
                    s.as_str().to_sql(ty, out)
                } else if *ty == Type::JSONB {
                    out.put_u8(1);
                    out.put_slice(s.as_bytes());
                    Ok(IsNull::No)
                } else {
                    Err(mismatch(self, ty))
                }
            }
            Value::Bytes(b) => {
                if *ty == Type::BYTEA {
                    b.as_slice().to_sql(ty, out)
                } else {
                    Err(mismatch(self, ty))
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn mismatch(
    value: &Value,
    ty: &Type,
) -> BoxError {
    format!("cannot encode {:?} as {}", value, ty).into()
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, BoxError> {
        if *ty == Type::BOOL {
            Ok(Value::Bool(bool::from_sql(ty, raw)?))
        } else if *ty == Type::INT2 {
            Ok(Value::Int(i16::from_sql(ty, raw)? as i64))
        } else if *ty == Type::INT4 {
            Ok(Value::Int(i32::from_sql(ty, raw)? as i64))
        } else if *ty == Type::INT8 {
            Ok(Value::Int(i64::from_sql(ty, raw)?))
        } else if *ty == Type::OID {
            Ok(Value::Int(u32::from_sql(ty, raw)? as i64))
        } else if *ty == Type::FLOAT4 {
            Ok(Value::Float(f32::from_sql(ty, raw)? as f64))
        } else if *ty == Type::FLOAT8 {
            Ok(Value::Float(f64::from_sql(ty, raw)?))
        } else if *ty == Type::NUMERIC {
            Ok(Value::Numeric(decode_numeric(raw)?))
        } else if is_text(ty) || *ty == Type::JSON {
            Ok(Value::Text(<&str>::from_sql(ty, raw)?.to_string()))
        } else if *ty == Type::JSONB {
            match raw.split_first() {
                Some((1, rest)) => Ok(Value::Text(std::str::from_utf8(rest)?.to_string())),
                _ => Err("unsupported jsonb version".into()),
            }
        } else if *ty == Type::PG_LSN {
            let lsn = u64::from_be_bytes(raw.try_into()?);
            Ok(Value::Text(format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)))
        } else if *ty == Type::CHAR {
            Ok(Value::Text(char::from(i8::from_sql(ty, raw)? as u8).to_string()))
        } else {
            Ok(Value::Bytes(raw.to_vec()))
        }
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Value::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Binary `numeric`: ndigits, weight, sign, dscale, then base-10000 digits.
pub(crate) fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let words: Vec<u16> = raw.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect();
    let [ndigits, weight, sign, dscale, digits @ ..] = words.as_slice() else {
        return Err("numeric value too short".into());
    };
    if raw.len() % 2 != 0 || digits.len() != *ndigits as usize {
        return Err("numeric value has wrong length".into());
    }
    let sign = match *sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS => "",
        NUMERIC_NEG => "-",
        other => return Err(format!("invalid numeric sign {:#x}", other).into()),
    };

    // groups past either end of `digits` are zero
    let group = |idx: i32| usize::try_from(idx).ok().and_then(|i| digits.get(i)).copied().unwrap_or(0);
    let weight = *weight as i16 as i32;
    let dscale = *dscale as usize;

    let mut int_part = if weight < 0 { "0".to_string() } else { group(0).to_string() };
    for idx in 1..=weight {
        int_part.push_str(&format!("{:04}", group(idx)));
    }
    let mut frac: String = (weight + 1..)
        .take(dscale.div_ceil(4))
        .map(|idx| format!("{:04}", group(idx)))
        .collect();
    frac.truncate(dscale);

    if frac.is_empty() {
        Ok(format!("{sign}{int_part}"))
    } else {
        Ok(format!("{sign}{int_part}.{frac}"))
    }
}

pub(crate) fn encode_numeric(
    text: &str,
    out: &mut BytesMut,
) -> Result<IsNull, BoxError> {
    let text = text.trim();
    let special = match text {
        "NaN" => Some(NUMERIC_NAN),
        "Infinity" | "inf" => Some(NUMERIC_PINF),
        "-Infinity" | "-inf" => Some(NUMERIC_NINF),
        _ => None,
    };
    if let Some(sign) = special {
        put_numeric(out, 0, sign, 0, &[]);
        return Ok(IsNull::No);
    }

    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (NUMERIC_NEG, rest),
        None => (NUMERIC_POS, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit())
    {
        return Err(format!("invalid numeric literal {:?}", text).into());
    }

    // left-pad the integer part and right-pad the fraction to whole groups
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let padded = format!("{}{}{}{}", "0".repeat(int_pad), int_part, frac_part, "0".repeat(frac_pad));
    let mut groups: Vec<u16> = padded
        .as_bytes()
        .chunks(4)
        .map(|c| c.iter().fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16))
        .collect();
    let mut weight = ((int_part.len() + int_pad) / 4) as i16 - 1;

    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        put_numeric(out, 0, NUMERIC_POS, frac_part.len() as u16, &[]);
    } else {
        put_numeric(out, weight, sign, frac_part.len() as u16, &groups);
    }
    Ok(IsNull::No)
}

fn put_numeric(
    out: &mut BytesMut,
    weight: i16,
    sign: u16,
    dscale: u16,
    groups: &[u16],
) {
    out.put_u16(groups.len() as u16);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(dscale);
    for g in groups {
        out.put_u16(*g);
    }
}

//! Conversions between template values and PostgreSQL wire types.
//!
//! Parameter types are inferred by the server, so a value is encoded for
//! whatever type the prepared statement reports: an `Integer` bound to a
//! `numeric` comparison is sent as `numeric`, a `Text` bound to an `int4`
//! column is parsed first. Result cells are decoded to JSON by column type.

use std::error::Error;
use std::net::IpAddr;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use postgres::Row;
use postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::template::VariableValue;

type BoxError = Box<dyn Error + Sync + Send>;
type BindResult = Result<IsNull, BoxError>;

impl ToSql for VariableValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> BindResult {
        match self {
            VariableValue::Null => Ok(IsNull::Yes),
            VariableValue::Text(s) | VariableValue::Enum(s) => bind_text(s, ty, out),
            VariableValue::Integer(n) => bind_integer(*n, ty, out),
            VariableValue::Float(f) => bind_float(*f, ty, out),
            VariableValue::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ if text_like(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch("boolean", ty)),
            },
            VariableValue::Date(d) => match *ty {
                Type::DATE => d.to_sql(ty, out),
                Type::TIMESTAMP => d.and_time(NaiveTime::MIN).to_sql(ty, out),
                Type::TIMESTAMPTZ => d.and_time(NaiveTime::MIN).and_utc().to_sql(ty, out),
                _ if text_like(ty) => d.to_string().to_sql(ty, out),
                _ => Err(mismatch("date", ty)),
            },
            VariableValue::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => ts.to_sql(ty, out),
                Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                Type::DATE => ts.date_naive().to_sql(ty, out),
                _ if text_like(ty) => ts
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                    .to_sql(ty, out),
                _ => Err(mismatch("timestamp", ty)),
            },
            VariableValue::Json(v) => match (ty, v) {
                (&Type::JSON | &Type::JSONB, _) => v.to_sql(ty, out),
                (_, Value::String(s)) => bind_text(s, ty, out),
                (_, Value::Bool(b)) => VariableValue::Bool(*b).to_sql(ty, out),
                (_, Value::Number(n)) => match n.as_i64() {
                    Some(i) => bind_integer(i, ty, out),
                    None => bind_float(n.as_f64().unwrap_or(f64::NAN), ty, out),
                },
                _ if text_like(ty) => v.to_string().to_sql(ty, out),
                _ => Err(mismatch("json", ty)),
            },
            VariableValue::Uuid(u) => match *ty {
                Type::UUID => u.to_sql(ty, out),
                _ if text_like(ty) => u.to_string().to_sql(ty, out),
                _ => Err(mismatch("uuid", ty)),
            },
            VariableValue::Raw(_) => Err("raw values are inlined into the statement, never bound".into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn mismatch(kind: &str, ty: &Type) -> BoxError {
    format!("cannot bind a {} value to a parameter of type {}", kind, ty.name()).into()
}

fn text_like(ty: &Type) -> bool {
    <&str as ToSql>::accepts(ty)
}

fn bind_text(s: &str, ty: &Type, out: &mut BytesMut) -> BindResult {
    if text_like(ty) {
        return s.to_sql(ty, out);
    }
    let t = s.trim();
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => bind_integer(t.parse()?, ty, out),
        Type::FLOAT4 | Type::FLOAT8 => bind_float(t.parse()?, ty, out),
        Type::NUMERIC => Decimal::from_str_exact(t)
            .or_else(|_| Decimal::from_scientific(t))?
            .to_sql(ty, out),
        Type::BOOL => match t.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "on" => true.to_sql(ty, out),
            "false" | "f" | "0" | "no" | "off" => false.to_sql(ty, out),
            _ => Err(format!("invalid boolean: {}", t).into()),
        },
        Type::UUID => Uuid::parse_str(t)?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<Value>(s)
            .unwrap_or_else(|_| Value::String(s.to_string()))
            .to_sql(ty, out),
        Type::DATE => NaiveDate::parse_from_str(t, "%Y-%m-%d")?.to_sql(ty, out),
        Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(t)?
            .with_timezone(&Utc)
            .to_sql(ty, out),
        Type::TIMESTAMP => NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f"))?
            .to_sql(ty, out),
        _ => Err(mismatch("text", ty)),
    }
}

fn bind_integer(n: i64, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::INT2 => i16::try_from(n)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(n)?.to_sql(ty, out),
        Type::INT8 => n.to_sql(ty, out),
        Type::OID => u32::try_from(n)?.to_sql(ty, out),
        Type::FLOAT4 => (n as f32).to_sql(ty, out),
        Type::FLOAT8 => (n as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(n).to_sql(ty, out),
        _ if text_like(ty) => n.to_string().to_sql(ty, out),
        _ => Err(mismatch("integer", ty)),
    }
}

fn bind_float(f: f64, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::FLOAT4 => (f as f32).to_sql(ty, out),
        Type::FLOAT8 => f.to_sql(ty, out),
        Type::NUMERIC => Decimal::try_from(f)?.to_sql(ty, out),
        Type::INT2 | Type::INT4 | Type::INT8 => bind_integer(float_to_integer(f)?, ty, out),
        _ if text_like(ty) => f.to_string().to_sql(ty, out),
        _ => Err(mismatch("number", ty)),
    }
}

/// Whole floats only; `as` would saturate out-of-range values.
fn float_to_integer(f: f64) -> Result<i64, BoxError> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Ok(f as i64)
    } else {
        Err(format!("{} is not a whole number in integer range", f).into())
    }
}

/// `numeric` cell as exact decimal text.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        // Decimal has no NaN or infinities; they are flagged in the sign word.
        let special = match raw.get(4..6) {
            Some([0xC0, 0x00]) => Some("NaN"),
            Some([0xD0, 0x00]) => Some("Infinity"),
            Some([0xF0, 0x00]) => Some("-Infinity"),
            _ => None,
        };
        match special {
            Some(s) => Ok(NumericText(s.to_string())),
            None => Decimal::from_sql(ty, raw).map(|d| NumericText(d.to_string())),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <Decimal as FromSql>::accepts(ty)
    }
}

/// Any value of a type without a JSON mapping; keeps only its size.
struct Opaque(usize);

impl<'a> FromSql<'a> for Opaque {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Opaque(raw.len()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn opt<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>, postgres::Error> {
    row.try_get(idx)
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn array_value<T>(items: Vec<Option<T>>, f: impl Fn(T) -> Value) -> Value {
    Value::Array(items.into_iter().map(|v| v.map(&f).unwrap_or(Value::Null)).collect())
}

/// Decodes one result cell to JSON. SQL NULL becomes `null`.
///
/// `numeric` is rendered as a string to keep its precision.
pub(crate) fn cell_to_json(row: &Row, idx: usize) -> Result<Value, postgres::Error> {
    let ty = row.columns()[idx].type_();
    let value = match *ty {
        Type::BOOL => opt::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => opt::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => opt::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => opt::<i64>(row, idx)?.map(Value::from),
        Type::OID => opt::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => opt::<f32>(row, idx)?.map(|f| float_value(f64::from(f))),
        Type::FLOAT8 => opt::<f64>(row, idx)?.map(float_value),
        Type::NUMERIC => opt::<NumericText>(row, idx)?.map(|n| Value::String(n.0)),
        Type::JSON | Type::JSONB => opt::<Value>(row, idx)?,
        Type::DATE => opt::<NaiveDate>(row, idx)?.map(|d| Value::String(d.to_string())),
        Type::TIMESTAMP => opt::<NaiveDateTime>(row, idx)?
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => opt::<DateTime<Utc>>(row, idx)?
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        Type::UUID => opt::<Uuid>(row, idx)?.map(|u| Value::String(u.to_string())),
        Type::INET => opt::<IpAddr>(row, idx)?.map(|a| Value::String(a.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => {
            opt::<Vec<Option<String>>>(row, idx)?.map(|v| array_value(v, Value::String))
        }
        Type::INT4_ARRAY => opt::<Vec<Option<i32>>>(row, idx)?.map(|v| array_value(v, Value::from)),
        Type::INT8_ARRAY => opt::<Vec<Option<i64>>>(row, idx)?.map(|v| array_value(v, Value::from)),
        _ if <String as FromSql>::accepts(ty) => opt::<String>(row, idx)?.map(Value::String),
        _ => opt::<Opaque>(row, idx)?
            .map(|o| Value::String(format!("<{} value, {} bytes>", ty.name(), o.0))),
    };
    Ok(value.unwrap_or(Value::Null))
}

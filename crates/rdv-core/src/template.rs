//! SQL template compiler.
//!
//! Templates carry named placeholders (`{{name}}`, optional inner whitespace).
//! Compilation validates every name against the variable schema, coerces the
//! supplied values by declared type and emits positional-parameter SQL
//! (`$1`, `$2`, ...) plus the aligned value list. Distinct names are numbered
//! in first-occurrence order; repeated occurrences share one parameter.
//!
//! ## Raw variables
//!
//! A `raw` variable is substituted as literal SQL text, never bound. This is
//! the one intentionally unsafe path: the caller asserts the value is already
//! trusted SQL. Callers serving untrusted input compile with
//! [`CompileOptions::allow_raw`] set to `false`.
//!
//! Placeholders are found lexically, including inside comments and string
//! literals.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::guard::is_word_char;
use crate::params::rewrite_placeholders;

/// Runtime input values keyed by variable name.
pub type InputValues = serde_json::Map<String, Value>;

/// Declared type of a template variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum VariableType {
    Text,
    Number,
    Boolean,
    Date,
    Timestamp,
    Json,
    Uuid,
    Raw,
    Enum,
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VariableType::Text => "text",
            VariableType::Number => "number",
            VariableType::Boolean => "boolean",
            VariableType::Date => "date",
            VariableType::Timestamp => "timestamp",
            VariableType::Json => "json",
            VariableType::Uuid => "uuid",
            VariableType::Raw => "raw",
            VariableType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A variable declared by a saved query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct VariableDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "api", schema(value_type = Option<Object>))]
    pub default: Option<Value>,
    /// Allowed values for `enum` variables. Ignored for other types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Query that produces the allowed values for `enum` variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_sql: Option<String>,
}

impl VariableDef {
    pub fn new(name: impl Into<String>, var_type: VariableType) -> Self {
        Self {
            name: name.into(),
            label: None,
            var_type,
            required: false,
            default: None,
            options: Vec::new(),
            options_sql: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Checks that the name is a plain identifier.
    pub fn validate(&self) -> Result<()> {
        if is_identifier(&self.name) {
            Ok(())
        } else {
            Err(Error::InvalidParams(format!(
                "variable name `{}` must match [A-Za-z_][A-Za-z0-9_]*",
                self.name
            )))
        }
    }
}

/// A coerced variable value, tagged by the declared type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VariableValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(Value),
    Uuid(Uuid),
    Enum(String),
    /// Trusted SQL text inlined into the statement body. Never bound.
    Raw(String),
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        VariableValue::Integer(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        VariableValue::Text(v.to_string())
    }
}

impl From<bool> for VariableValue {
    fn from(v: bool) -> Self {
        VariableValue::Bool(v)
    }
}

impl VariableValue {
    /// Plain JSON rendering (dates as ISO strings).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// SQL literal used by [`render_preview`].
    fn preview_literal(&self) -> String {
        match self {
            VariableValue::Null => "NULL".to_string(),
            VariableValue::Text(s) | VariableValue::Enum(s) => quote_literal(s),
            VariableValue::Uuid(u) => quote_literal(&u.to_string()),
            VariableValue::Integer(n) => n.to_string(),
            VariableValue::Float(n) => n.to_string(),
            VariableValue::Bool(true) => "TRUE".to_string(),
            VariableValue::Bool(false) => "FALSE".to_string(),
            VariableValue::Date(d) => format!("{}::date", quote_literal(&d.to_string())),
            VariableValue::Timestamp(ts) => format!(
                "{}::timestamptz",
                quote_literal(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            ),
            VariableValue::Json(v) => format!("{}::jsonb", quote_literal(&v.to_string())),
            VariableValue::Raw(s) => s.clone(),
        }
    }
}

/// Parameterized SQL text and the values bound to it.
///
/// `values[i - 1]` binds `$i`; `placeholders[i - 1]` names the variable bound
/// there (empty for statements built from fixed text).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct CompiledStatement {
    pub text: String,
    #[cfg_attr(feature = "api", schema(value_type = Vec<Object>))]
    pub values: Vec<VariableValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub placeholders: Vec<String>,
}

impl CompiledStatement {
    /// Statement from fixed text with no named placeholders.
    pub fn new(text: impl Into<String>, values: Vec<VariableValue>) -> Self {
        Self {
            text: text.into(),
            values,
            placeholders: Vec::new(),
        }
    }
}

/// Per-call compiler settings.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Whether `raw` variables may be inlined. When false they are rejected.
    pub allow_raw: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { allow_raw: true }
    }
}

/// One `{{name}}` occurrence: byte range in the template and the name.
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(is_word_char),
        _ => false,
    }
}

/// Finds every `{{ name }}` token, left to right.
fn scan_placeholders(sql: &str) -> Vec<Placeholder<'_>> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut search = 0;

    while let Some(pos) = sql[search..].find("{{") {
        let start = search + pos;
        let mut i = start + 2;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name_start = i;
        if i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_') {
            i += 1;
            while i < bytes.len() && is_word_char(bytes[i] as char) {
                i += 1;
            }
        }
        let name_end = i;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if name_end > name_start && sql[i..].starts_with("}}") {
            found.push(Placeholder {
                start,
                end: i + 2,
                name: &sql[name_start..name_end],
            });
            search = i + 2;
        } else {
            search = start + 1;
        }
    }
    found
}

fn distinct_names<'a>(placeholders: &[Placeholder<'a>]) -> Vec<&'a str> {
    let mut names: Vec<&str> = Vec::new();
    for p in placeholders {
        if !names.contains(&p.name) {
            names.push(p.name);
        }
    }
    names
}

/// Distinct placeholder names in first-occurrence order.
pub fn extract_var_names(sql: &str) -> Vec<String> {
    distinct_names(&scan_placeholders(sql))
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Compiles `sql` with default options (raw variables allowed).
pub fn compile(sql: &str, vars: &[VariableDef], values: &InputValues) -> Result<CompiledStatement> {
    compile_with(sql, vars, values, &CompileOptions::default())
}

/// Compiles a template into positional-parameter SQL and its bound values.
pub fn compile_with(
    sql: &str,
    vars: &[VariableDef],
    values: &InputValues,
    opts: &CompileOptions,
) -> Result<CompiledStatement> {
    let by_name = index_definitions(vars)?;
    let placeholders = scan_placeholders(sql);
    let names = distinct_names(&placeholders);

    let unknown: Vec<String> = names
        .iter()
        .filter(|n| !by_name.contains_key(*n))
        .map(|n| n.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(Error::UnknownVariable { names: unknown });
    }

    // Resolve first so that every missing name is reported at once.
    let mut resolved: Vec<(&VariableDef, Option<&Value>)> = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in &names {
        let def = by_name[name];
        let input = present(values.get(*name)).or_else(|| present(def.default.as_ref()));
        if input.is_none() && def.required {
            missing.push(name.to_string());
        }
        resolved.push((def, input));
    }
    if !missing.is_empty() {
        return Err(Error::MissingVariable { missing });
    }

    let mut replacement: HashMap<&str, String> = HashMap::with_capacity(names.len());
    let mut bound = Vec::new();
    let mut bound_names = Vec::new();
    for (def, input) in resolved {
        let value = match input {
            Some(v) => coerce(def, v)?,
            None => VariableValue::Null,
        };
        if def.var_type == VariableType::Raw {
            if !opts.allow_raw {
                return Err(Error::TypeCoercion {
                    name: def.name.clone(),
                    expected: VariableType::Raw,
                    reason: "raw variables are disabled for this caller".to_string(),
                });
            }
            let inline = match value {
                VariableValue::Raw(s) => s,
                _ => "NULL".to_string(),
            };
            replacement.insert(def.name.as_str(), inline);
        } else {
            bound.push(value);
            bound_names.push(def.name.clone());
            replacement.insert(def.name.as_str(), format!("${}", bound.len()));
        }
    }

    let mut text = String::with_capacity(sql.len());
    let mut last = 0;
    for p in &placeholders {
        text.push_str(&sql[last..p.start]);
        text.push_str(&replacement[p.name]);
        last = p.end;
    }
    text.push_str(&sql[last..]);

    Ok(CompiledStatement {
        text,
        values: bound,
        placeholders: bound_names,
    })
}

/// Validates every definition and indexes them by name.
fn index_definitions(vars: &[VariableDef]) -> Result<HashMap<&str, &VariableDef>> {
    let mut by_name = HashMap::with_capacity(vars.len());
    for def in vars {
        def.validate()?;
        if by_name.insert(def.name.as_str(), def).is_some() {
            return Err(Error::InvalidParams(format!(
                "variable `{}` is declared more than once",
                def.name
            )));
        }
    }
    Ok(by_name)
}

/// Treats JSON `null` and the empty string as "no value".
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null() && v.as_str() != Some(""))
}

/// Coerces one supplied value to the variable's declared type.
pub fn coerce(def: &VariableDef, value: &Value) -> Result<VariableValue> {
    let fail = |reason: &str| Error::TypeCoercion {
        name: def.name.clone(),
        expected: def.var_type,
        reason: reason.to_string(),
    };

    match def.var_type {
        VariableType::Text => scalar_string(value)
            .map(VariableValue::Text)
            .ok_or_else(|| fail("expected a scalar value")),
        VariableType::Raw => scalar_string(value)
            .map(VariableValue::Raw)
            .ok_or_else(|| fail("expected SQL text")),
        VariableType::Enum => {
            let v = scalar_string(value).ok_or_else(|| fail("expected a scalar value"))?;
            if !def.options.is_empty() && !def.options.contains(&v) {
                return Err(fail(&format!("must be one of: {}", def.options.join(", "))));
            }
            Ok(VariableValue::Enum(v))
        }
        VariableType::Number => coerce_number(value).ok_or_else(|| fail("not a finite number")),
        VariableType::Boolean => match value {
            Value::Bool(b) => Ok(VariableValue::Bool(*b)),
            Value::String(s) if s == "true" || s == "1" => Ok(VariableValue::Bool(true)),
            Value::String(s) if s == "false" || s == "0" => Ok(VariableValue::Bool(false)),
            Value::Number(n) if n.as_f64() == Some(1.0) => Ok(VariableValue::Bool(true)),
            Value::Number(n) if n.as_f64() == Some(0.0) => Ok(VariableValue::Bool(false)),
            _ => Err(fail("expected true/false")),
        },
        VariableType::Date => parse_timestamp_value(value)
            .map(|ts| match ts {
                Parsed::Date(d) => VariableValue::Date(d),
                Parsed::Instant(ts) => VariableValue::Date(ts.date_naive()),
            })
            .ok_or_else(|| fail("not a valid date")),
        VariableType::Timestamp => parse_timestamp_value(value)
            .map(|ts| match ts {
                Parsed::Date(d) => VariableValue::Timestamp(d.and_time(Default::default()).and_utc()),
                Parsed::Instant(ts) => VariableValue::Timestamp(ts),
            })
            .ok_or_else(|| fail("not a valid timestamp")),
        VariableType::Json => match value {
            Value::String(s) => serde_json::from_str(s)
                .map(VariableValue::Json)
                .map_err(|_| fail("not valid JSON")),
            other => Ok(VariableValue::Json(other.clone())),
        },
        VariableType::Uuid => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(VariableValue::Uuid)
            .ok_or_else(|| fail("not a valid UUID")),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_number(value: &Value) -> Option<VariableValue> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(VariableValue::Integer(i)),
            None => n.as_f64().filter(|f| f.is_finite()).map(float_or_integer),
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(VariableValue::Integer(i));
            }
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(float_or_integer)
        }
        _ => None,
    }
}

fn float_or_integer(f: f64) -> VariableValue {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        VariableValue::Integer(f as i64)
    } else {
        VariableValue::Float(f)
    }
}

enum Parsed {
    Date(NaiveDate),
    Instant(DateTime<Utc>),
}

/// Accepts RFC 3339, `YYYY-MM-DD[ T]HH:MM[:SS[.f]]` (UTC), `YYYY-MM-DD`, or
/// epoch milliseconds.
fn parse_timestamp_value(value: &Value) -> Option<Parsed> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Parsed::Instant),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Some(Parsed::Date(d));
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(Parsed::Instant(ts.with_timezone(&Utc)));
            }
            const NAIVE_FORMATS: &[&str] = &[
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M",
                "%Y-%m-%d %H:%M",
            ];
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|ts| Parsed::Instant(ts.and_utc()))
        }
        _ => None,
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Renders a human-readable SQL string with values inlined as literals.
///
/// For display only. The output must never be executed.
pub fn render_preview(compiled: &CompiledStatement) -> String {
    rewrite_placeholders(&compiled.text, |index| {
        index
            .checked_sub(1)
            .and_then(|i| compiled.values.get(i))
            .map(VariableValue::preview_literal)
    })
}

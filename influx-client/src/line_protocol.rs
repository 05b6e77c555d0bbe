//! Line protocol encoding and decoding.
//!
//! ```text
//! <measurement>[,<tag>=<value>...] <field>=<value>[,...] [<timestamp>]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::escape;
use crate::schema::{self, Schema};
use crate::time::{cast_timestamp, Precision, Timestamp};

// ------------------------------------------------------------------ //
//  Field values                                                       //
// ------------------------------------------------------------------ //

/// A field value as supplied by the caller, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
    /// Omitted from the written line.
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::String(v) => f.write_str(v),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::Null => f.write_str("null"),
        }
    }
}

macro_rules! field_from {
    ($variant:ident: $($ty:ty),+) => {
        $(impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                FieldValue::$variant(v.into())
            }
        })+
    };
}

field_from!(Float: f64, f32);
field_from!(Integer: i64, i32, i16, i8, u32, u16, u8);
field_from!(String: String, &str);
field_from!(Boolean: bool);

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

// ------------------------------------------------------------------ //
//  Points                                                             //
// ------------------------------------------------------------------ //

/// One point to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Point {
    /// Can be left empty when the measurement is supplied by the write call.
    pub measurement: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Server assigns the time when absent.
    pub timestamp: Option<Timestamp>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: Some(measurement.into()),
            ..Self::default()
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(mut self, ts: impl Into<Timestamp>) -> Self {
        self.timestamp = Some(ts.into());
        self
    }
}

/// Encodes a single point as one line. Fields go through `schema` when one
/// is registered for the measurement.
pub fn encode_point(
    measurement: &str,
    point: &Point,
    schema: Option<&Schema>,
    precision: Precision,
) -> Result<String> {
    let (fields, tag_names) = match schema {
        Some(s) => (s.coerce_fields(&point.fields)?, s.check_tags(&point.tags)?),
        None => (
            schema::coerce_fields_permissive(&point.fields)?,
            point.tags.keys().cloned().collect(),
        ),
    };
    if fields.is_empty() {
        return Err(Error::Validation(format!(
            "point for measurement '{measurement}' has no fields"
        )));
    }

    let mut line = escape::measurement(measurement);
    for name in &tag_names {
        line.push(',');
        line.push_str(&escape::tag(name));
        line.push('=');
        line.push_str(&escape::tag(&point.tags[name]));
    }

    line.push(' ');
    let fields: Vec<String> = fields
        .iter()
        .map(|(k, v)| format!("{}={}", escape::tag(k), v))
        .collect();
    line.push_str(&fields.join(","));

    if let Some(ts) = &point.timestamp {
        line.push(' ');
        line.push_str(&cast_timestamp(ts, precision)?);
    }
    Ok(line)
}

// ------------------------------------------------------------------ //
//  Decoding                                                           //
// ------------------------------------------------------------------ //

/// A decoded line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: Option<String>,
}

/// Decodes one line of line protocol.
pub fn parse_line(line: &str) -> Result<ParsedLine> {
    let malformed = |why: &str| Error::Validation(format!("malformed line ({why}): {line}"));

    let line = line.trim_end_matches(['\n', '\r']);
    let key_end = find_unescaped(line, ' ', false).ok_or_else(|| malformed("no field set"))?;
    let (key, rest) = (&line[..key_end], &line[key_end + 1..]);

    let mut key_parts = split_unescaped(key, ',', false).into_iter();
    let measurement = escape::unescape(key_parts.next().unwrap_or_default());
    if measurement.is_empty() {
        return Err(malformed("empty measurement"));
    }
    let mut tags = Vec::new();
    for pair in key_parts {
        let (k, v) = split_pair(pair, false).ok_or_else(|| malformed("bad tag"))?;
        tags.push((escape::unescape(k), escape::unescape(v)));
    }

    let mut sections = split_unescaped(rest, ' ', true).into_iter();
    let field_set = sections.next().unwrap_or_default();
    let timestamp = sections.next().map(str::to_string);
    if sections.next().is_some() {
        return Err(malformed("trailing data"));
    }

    let mut fields = Vec::new();
    for pair in split_unescaped(field_set, ',', true) {
        let (k, v) = split_pair(pair, true).ok_or_else(|| malformed("bad field"))?;
        let value = parse_field_value(v).ok_or_else(|| malformed("bad field value"))?;
        fields.push((escape::unescape(k), value));
    }
    if fields.is_empty() {
        return Err(malformed("no fields"));
    }

    Ok(ParsedLine {
        measurement,
        tags,
        fields,
        timestamp,
    })
}

fn parse_field_value(raw: &str) -> Option<FieldValue> {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Some(FieldValue::String(escape::unescape(&raw[1..raw.len() - 1])));
    }
    match raw {
        "T" | "t" | "true" | "True" | "TRUE" => return Some(FieldValue::Boolean(true)),
        "F" | "f" | "false" | "False" | "FALSE" => return Some(FieldValue::Boolean(false)),
        _ => {}
    }
    if let Some(int) = raw.strip_suffix('i') {
        return int.parse().ok().map(FieldValue::Integer);
    }
    raw.parse().ok().map(FieldValue::Float)
}

fn split_pair(s: &str, quotes: bool) -> Option<(&str, &str)> {
    let idx = find_unescaped(s, '=', quotes)?;
    let (k, v) = (&s[..idx], &s[idx + 1..]);
    (!k.is_empty()).then_some((k, v))
}

fn find_unescaped(s: &str, delim: char, quotes: bool) -> Option<usize> {
    let mut escaped = false;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if quotes => in_quotes = !in_quotes,
            c if c == delim && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_unescaped(s: &str, delim: char, quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(idx) = find_unescaped(rest, delim, quotes) {
        parts.push(&rest[..idx]);
        rest = &rest[idx + delim.len_utf8()..];
    }
    parts.push(rest);
    parts
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

//! Per-measurement field and tag schemas.
//!
//! A schema turns caller-supplied field values into typed line-protocol
//! literals and rejects anything it does not declare. Measurements without a
//! schema go through [`coerce_fields_permissive`] instead.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::escape;
use crate::line_protocol::FieldValue;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Integer,
    String,
    Boolean,
}

/// Static schema configuration for one measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub database: String,
    pub measurement: String,
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A validated, immutable schema.
#[derive(Debug, Clone)]
pub struct Schema {
    definition: SchemaDefinition,
    tag_names: BTreeSet<String>,
}

impl Schema {
    pub fn new(definition: SchemaDefinition) -> Self {
        let tag_names = definition.tags.iter().cloned().collect();
        Self {
            definition,
            tag_names,
        }
    }

    pub fn database(&self) -> &str {
        &self.definition.database
    }

    pub fn measurement(&self) -> &str {
        &self.definition.measurement
    }

    /// Coerces `values` into `(field name, literal)` pairs in key order.
    /// Null values are skipped.
    pub fn coerce_fields(
        &self,
        values: &BTreeMap<String, FieldValue>,
    ) -> Result<Vec<(String, String)>> {
        let extraneous: Vec<&str> = values
            .keys()
            .filter(|k| !self.definition.fields.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if !extraneous.is_empty() {
            return Err(Error::Validation(format!(
                "{} has extraneous fields: {}",
                self.reference(),
                extraneous.join(", ")
            )));
        }

        let mut out = Vec::with_capacity(values.len());
        for (name, value) in values {
            if value.is_null() {
                continue;
            }
            let literal = match self.definition.fields[name] {
                FieldType::Integer => self.integer_literal(name, value)?,
                FieldType::Float => self.float_literal(name, value)?,
                FieldType::Boolean => match value {
                    FieldValue::Boolean(true) => "T".to_string(),
                    FieldValue::Boolean(false) => "F".to_string(),
                    other => {
                        return Err(Error::Validation(format!(
                            "expected boolean value for {}.{name}, but got '{other}'",
                            self.reference()
                        )))
                    }
                },
                FieldType::String => escape::quoted(&value.to_string()),
            };
            out.push((name.clone(), literal));
        }
        Ok(out)
    }

    /// Returns the tag names in key order, rejecting undeclared tags.
    pub fn check_tags(&self, values: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let extraneous: Vec<&str> = values
            .keys()
            .filter(|k| !self.tag_names.contains(k.as_str()))
            .map(String::as_str)
            .collect();
        if !extraneous.is_empty() {
            return Err(Error::Validation(format!(
                "{} has extraneous tags: {}",
                self.reference(),
                extraneous.join(", ")
            )));
        }
        Ok(values.keys().cloned().collect())
    }

    fn reference(&self) -> String {
        format!("{}.{}", self.definition.database, self.definition.measurement)
    }

    fn numeric(&self, name: &str, value: &FieldValue) -> Result<Numeric> {
        let parsed = match value {
            FieldValue::Integer(i) => Some(Numeric::Int(*i)),
            FieldValue::Float(f) if f.is_finite() => Some(Numeric::Float(*f)),
            FieldValue::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Numeric::Int)
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Numeric::Float))
            }
            _ => None,
        };
        parsed.ok_or_else(|| {
            Error::Validation(format!(
                "expected numeric value for {}.{name}, but got '{value}'",
                self.reference()
            ))
        })
    }

    fn integer_literal(&self, name: &str, value: &FieldValue) -> Result<String> {
        Ok(match self.numeric(name, value)? {
            Numeric::Int(i) => format!("{i}i"),
            Numeric::Float(f) => format!("{}i", f.trunc() as i64),
        })
    }

    fn float_literal(&self, name: &str, value: &FieldValue) -> Result<String> {
        Ok(match self.numeric(name, value)? {
            Numeric::Int(i) => i.to_string(),
            Numeric::Float(f) => f.to_string(),
        })
    }
}

enum Numeric {
    Int(i64),
    Float(f64),
}

/// Best-effort coercion for measurements without a schema: numbers are
/// stringified, strings quoted, booleans written as `true`/`false`.
pub fn coerce_fields_permissive(
    values: &BTreeMap<String, FieldValue>,
) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(values.len());
    for (name, value) in values {
        let literal = match value {
            FieldValue::Null => continue,
            FieldValue::Float(f) if !f.is_finite() => {
                return Err(Error::Validation(format!(
                    "field '{name}' has non-finite value {f}"
                )))
            }
            FieldValue::String(s) => escape::quoted(s),
            other => other.to_string(),
        };
        out.push((name.clone(), literal));
    }
    Ok(out)
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

//! Query response parsing.
//!
//! The `/query` endpoint answers with
//!
//! ```text
//! { "results": [ { "series": [ { "name", "tags", "columns", "values" } ], "error" } ], "error" }
//! ```
//!
//! Every statement becomes one [`Results`]: a flat list of rows plus an index
//! of which rows came from which series.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::time::{NanoDate, Precision};

// ------------------------------------------------------------------ //
//  Wire envelope                                                      //
// ------------------------------------------------------------------ //

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    name: String,
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    columns: Vec<String>,
    values: Option<Vec<Vec<Value>>>,
}

// ------------------------------------------------------------------ //
//  Rows and groups                                                    //
// ------------------------------------------------------------------ //

/// One result row: every non-time column by name, plus the row time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    /// Absent when the series has no `time` column (e.g. `SHOW DATABASES`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<NanoDate>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}

/// The rows of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    range: Range<usize>,
}

/// Rows of one statement, indexed by series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    rows: Vec<Row>,
    groups: Vec<Group>,
}

impl Results {
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Rows belonging to `group`.
    pub fn rows_in(&self, group: &Group) -> &[Row] {
        self.rows.get(group.range.clone()).unwrap_or_default()
    }

    /// Rows of the first series whose tags match every `(key, value)` in
    /// `matcher`. Series are only considered when their tag-key count equals
    /// the matcher's. Untagged results never match, not even an empty
    /// matcher; use [`Results::rows`] for those.
    pub fn group<K: AsRef<str>, V: AsRef<str>>(&self, matcher: &[(K, V)]) -> &[Row] {
        let Some(first) = self.groups.first() else {
            return &[];
        };
        if first.tags.is_empty() || first.tags.len() != matcher.len() {
            return &[];
        }
        self.groups
            .iter()
            .find(|g| {
                matcher
                    .iter()
                    .all(|(k, v)| g.tags.get(k.as_ref()).map(String::as_str) == Some(v.as_ref()))
            })
            .map(|g| self.rows_in(g))
            .unwrap_or_default()
    }

    /// Maps every row into `T`. The row time is presented as an RFC 3339
    /// string under `time`.
    pub fn deserialize_rows<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.rows
            .iter()
            .map(|row| Ok(serde_json::from_value(serde_json::to_value(row)?)?))
            .collect()
    }

    fn from_series(series: Vec<Series>, precision: Option<Precision>) -> Result<Self> {
        let mut results = Results::default();
        for s in series {
            let time_col = s.columns.iter().position(|c| c == "time");
            let start = results.rows.len();

            for values in s.values.unwrap_or_default() {
                let time = match time_col.and_then(|i| values.get(i)) {
                    Some(v) => parse_time(v, precision)?,
                    None => None,
                };
                let values = s
                    .columns
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != time_col)
                    .map(|(i, col)| (col.clone(), values.get(i).cloned().unwrap_or(Value::Null)))
                    .collect();
                results.rows.push(Row { time, values });
            }

            results.groups.push(Group {
                name: s.name,
                tags: s.tags.unwrap_or_default(),
                range: start..results.rows.len(),
            });
        }
        Ok(results)
    }
}

/// Parse result for a request that may carry several statements.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// Exactly one statement result.
    Single(Results),
    Batch(Vec<Results>),
}

impl QueryOutput {
    /// The single statement's results; the first of a batch.
    pub fn into_single(self) -> Results {
        match self {
            QueryOutput::Single(r) => r,
            QueryOutput::Batch(v) => v.into_iter().next().unwrap_or_default(),
        }
    }

    pub fn into_vec(self) -> Vec<Results> {
        match self {
            QueryOutput::Single(r) => vec![r],
            QueryOutput::Batch(v) => v,
        }
    }
}

// ------------------------------------------------------------------ //
//  Parsing                                                            //
// ------------------------------------------------------------------ //

/// Parses a raw response body. `precision` is the `epoch` the query was
/// sent with; without one the server returns RFC 3339 times.
pub fn parse(body: &[u8], precision: Option<Precision>) -> Result<QueryOutput> {
    parse_envelope(serde_json::from_slice(body)?, precision)
}

/// Same as [`parse`] for an already decoded body.
pub fn parse_value(body: Value, precision: Option<Precision>) -> Result<QueryOutput> {
    parse_envelope(serde_json::from_value(body)?, precision)
}

fn parse_envelope(envelope: Envelope, precision: Option<Precision>) -> Result<QueryOutput> {
    if let Some(message) = envelope.error {
        return Err(Error::Query(message));
    }
    if let Some(message) = envelope.results.iter().find_map(|r| r.error.clone()) {
        return Err(Error::Query(message));
    }

    let mut all = envelope
        .results
        .into_iter()
        .map(|r| Results::from_series(r.series, precision))
        .collect::<Result<Vec<_>>>()?;

    Ok(if all.len() == 1 {
        QueryOutput::Single(all.remove(0))
    } else {
        QueryOutput::Batch(all)
    })
}

fn parse_time(value: &Value, precision: Option<Precision>) -> Result<Option<NanoDate>> {
    let precision = precision.unwrap_or_default();
    match value {
        Value::Null => Ok(None),
        Value::String(s) => NanoDate::parse_iso(s).map(Some),
        Value::Number(n) => match n.as_i64() {
            Some(i) => NanoDate::from_epoch(i, precision).map(Some),
            None => n
                .as_f64()
                .ok_or_else(|| Error::Query(format!("time value out of range: {n}")))
                .and_then(|f| NanoDate::from_epoch(f.trunc() as i64, precision))
                .map(Some),
        },
        other => Err(Error::Query(format!("unexpected time value: {other}"))),
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grouped() -> Results {
        parse_value(
            json!({
                "results": [{
                    "series": [
                        {
                            "name": "cpu",
                            "tags": { "tag": "a" },
                            "columns": ["time", "value"],
                            "values": [
                                ["2016-10-09T03:58:00.231035600Z", 1],
                                ["2016-10-09T03:58:01Z", 2]
                            ]
                        },
                        {
                            "name": "cpu",
                            "tags": { "tag": "b" },
                            "columns": ["time", "value"],
                            "values": [["2016-10-09T03:58:02Z", 3]]
                        }
                    ]
                }]
            }),
            None,
        )
        .unwrap()
        .into_single()
    }

    #[test]
    fn flattens_rows_across_series() {
        let results = grouped();
        assert_eq!(results.len(), 3);
        assert_eq!(results.rows()[2].get("value"), Some(&json!(3)));
        assert_eq!(results.groups().len(), 2);
        assert_eq!(results.groups()[1].tags["tag"], "b");
        assert_eq!(results.rows_in(&results.groups()[1]).len(), 1);
    }

    #[test]
    fn group_matches_exact_tag_set() {
        let results = grouped();
        let a = results.group(&[("tag", "a")]);
        assert_eq!(a, &results.rows()[..2]);
        assert!(results.group(&[("tag", "c")]).is_empty());
        assert!(results.group(&[("tag2", "a")]).is_empty());
        assert!(results.group(&[("tag", "a"), ("other", "x")]).is_empty());
    }

    #[test]
    fn group_on_untagged_series_is_empty() {
        let results = parse_value(
            json!({ "results": [{ "series": [{ "name": "m", "columns": ["time", "v"], "values": [[0, 1]] }] }] }),
            Some(Precision::Seconds),
        )
        .unwrap()
        .into_single();
        assert!(results.group(&[("tag", "a")]).is_empty());
        assert!(results.group::<&str, &str>(&[]).is_empty());
        assert_eq!(results.rows().len(), 1);
    }

    #[test]
    fn iso_times_keep_nanoseconds() {
        let results = grouped();
        let time = results.rows()[0].time.as_ref().unwrap();
        assert!(time.has_nano_precision());
        assert_eq!(time.nano_time(), "1475985480231035600");
        assert_eq!(time.millis(), 1_475_985_480_231);
    }

    #[test]
    fn epoch_times_follow_requested_precision() {
        let body = br#"{"results":[{"series":[{"name":"m","columns":["time","v"],"values":[[1475985480231035,1]]}]}]}"#;
        let micros = parse(body, Some(Precision::Microseconds)).unwrap().into_single();
        let time = micros.rows()[0].time.as_ref().unwrap();
        assert!(time.has_nano_precision());
        assert_eq!(time.nano_time(), "1475985480231035000");

        let body = br#"{"results":[{"series":[{"name":"m","columns":["time","v"],"values":[[1475985480231,1]]}]}]}"#;
        let millis = parse(body, Some(Precision::Milliseconds)).unwrap().into_single();
        let time = millis.rows()[0].time.as_ref().unwrap();
        assert!(!time.has_nano_precision());
        assert_eq!(time.millis(), 1_475_985_480_231);
    }

    #[test]
    fn series_without_time_column_have_no_time() {
        let results = parse_value(
            json!({ "results": [{ "series": [{
                "name": "databases",
                "columns": ["name"],
                "values": [["_internal"], ["metrics"]]
            }] }] }),
            None,
        )
        .unwrap()
        .into_single();
        assert!(results.rows().iter().all(|r| r.time.is_none()));
        assert_eq!(results.rows()[1].get("name"), Some(&json!("metrics")));
    }

    #[test]
    fn statement_error_fails_the_parse() {
        let err = parse_value(
            json!({ "results": [{ "series": [] }, { "error": "database not found: nope" }] }),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Query(ref m) if m == "database not found: nope"));
    }

    #[test]
    fn envelope_error_fails_the_parse() {
        let err = parse(br#"{"error":"error parsing query"}"#, None).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn several_statements_yield_a_batch() {
        let output = parse_value(json!({ "results": [{}, { "series": [] }] }), None).unwrap();
        match output {
            QueryOutput::Batch(all) => {
                assert_eq!(all.len(), 2);
                assert!(all.iter().all(Results::is_empty));
            }
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        assert!(matches!(parse(b"not json", None), Err(Error::Json(_))));
    }

    #[test]
    fn rows_deserialize_into_caller_types() {
        #[derive(Debug, Deserialize)]
        struct Sample {
            time: String,
            value: i64,
        }
        let samples: Vec<Sample> = grouped().deserialize_rows().unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].time, "2016-10-09T03:58:00.231035600Z");
        assert_eq!(samples[2].value, 3);
    }
}

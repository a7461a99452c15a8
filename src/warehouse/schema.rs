// ABOUTME: Best-effort schema autodetection for normalized NDJSON period files
// ABOUTME: Samples records and infers one typed column per key with widening rules

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// How many records are sampled before the schema is fixed.
pub const SAMPLE_LIMIT: usize = 1000;

/// Warehouse column types the autodetection can produce.
///
/// Anything that does not fit a narrower type widens to `Text`; nested
/// arrays and objects land in `Jsonb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bigint,
    Double,
    Boolean,
    Date,
    Text,
    Jsonb,
}

impl SqlType {
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Bigint => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Text => "TEXT",
            SqlType::Jsonb => "JSONB",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
}

/// An inferred table shape: columns in the order their keys were first
/// encountered in the sample.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// Infer a table schema from the first [`SAMPLE_LIMIT`] records of a
/// newline-delimited JSON file.
///
/// Every line must be a JSON object; keys become columns. A key whose
/// sampled values never carry a concrete type (all null) falls back to
/// `Text`. This is best-effort autodetection: values outside the sample
/// that do not fit the inferred type load as NULL rather than failing the
/// batch.
pub fn infer_from_ndjson(path: &Path) -> Result<TableSchema> {
    let reader = BufReader::new(
        fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    );

    let mut columns: Vec<(String, Option<SqlType>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut sampled = 0usize;

    for line in reader.lines() {
        if sampled >= SAMPLE_LIMIT {
            break;
        }
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }

        let value: JsonValue = serde_json::from_str(&line)
            .with_context(|| format!("Malformed record while sampling {:?}", path))?;
        let JsonValue::Object(object) = value else {
            bail!("Expected a JSON object per line in {:?}", path);
        };

        for (key, value) in &object {
            let observed = classify(value);
            match index.get(key) {
                Some(&i) => {
                    let current = columns[i].1;
                    columns[i].1 = widen(current, observed);
                }
                None => {
                    index.insert(key.clone(), columns.len());
                    columns.push((key.clone(), observed));
                }
            }
        }
        sampled += 1;
    }

    if columns.is_empty() {
        bail!("Cannot infer a schema from {:?}: no records", path);
    }

    Ok(TableSchema {
        columns: columns
            .into_iter()
            .map(|(name, sql_type)| Column {
                name,
                sql_type: sql_type.unwrap_or(SqlType::Text),
            })
            .collect(),
    })
}

/// The narrowest type a single value fits. Nulls carry no information.
fn classify(value: &JsonValue) -> Option<SqlType> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(_) => Some(SqlType::Boolean),
        JsonValue::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(SqlType::Bigint)
            } else {
                Some(SqlType::Double)
            }
        }
        JsonValue::String(s) => {
            if parse_date(s).is_some() {
                Some(SqlType::Date)
            } else {
                Some(SqlType::Text)
            }
        }
        JsonValue::Array(_) | JsonValue::Object(_) => Some(SqlType::Jsonb),
    }
}

/// Combine the type seen so far with a newly observed one.
fn widen(current: Option<SqlType>, observed: Option<SqlType>) -> Option<SqlType> {
    match (current, observed) {
        (None, t) | (t, None) => t,
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(SqlType::Bigint), Some(SqlType::Double))
        | (Some(SqlType::Double), Some(SqlType::Bigint)) => Some(SqlType::Double),
        (Some(SqlType::Jsonb), Some(_)) | (Some(_), Some(SqlType::Jsonb)) => Some(SqlType::Jsonb),
        _ => Some(SqlType::Text),
    }
}

/// Parse the date formats the feed and the normalizer emit.
pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    for format in ["%Y-%m-%d", "%d-%m-%Y", "%Y.%m.%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_ndjson(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("period.json");
        let mut file = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        (dir, path)
    }

    #[test]
    fn test_infer_basic_types() {
        let (_dir, path) = write_ndjson(&[
            r#"{"registration": "AB12CDE", "motTestCount": 3, "valid": true, "date": "09-01-2026", "motTests": []}"#,
        ]);
        let schema = infer_from_ndjson(&path).unwrap();

        let types: HashMap<_, _> = schema
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.sql_type))
            .collect();
        assert_eq!(types["registration"], SqlType::Text);
        assert_eq!(types["motTestCount"], SqlType::Bigint);
        assert_eq!(types["valid"], SqlType::Boolean);
        assert_eq!(types["date"], SqlType::Date);
        assert_eq!(types["motTests"], SqlType::Jsonb);
    }

    #[test]
    fn test_integer_widens_to_double() {
        let (_dir, path) = write_ndjson(&[
            r#"{"registration": "A", "odometer": 10}"#,
            r#"{"registration": "B", "odometer": 10.5}"#,
        ]);
        let schema = infer_from_ndjson(&path).unwrap();
        let column = schema.columns.iter().find(|c| c.name == "odometer").unwrap();
        assert_eq!(column.sql_type, SqlType::Double);
    }

    #[test]
    fn test_mixed_scalar_widens_to_text() {
        let (_dir, path) = write_ndjson(&[
            r#"{"registration": "A", "engineSize": 1796}"#,
            r#"{"registration": "B", "engineSize": "unknown"}"#,
        ]);
        let schema = infer_from_ndjson(&path).unwrap();
        let column = schema
            .columns
            .iter()
            .find(|c| c.name == "engineSize")
            .unwrap();
        assert_eq!(column.sql_type, SqlType::Text);
    }

    #[test]
    fn test_date_and_plain_string_widen_to_text() {
        let (_dir, path) = write_ndjson(&[
            r#"{"registration": "A", "firstUsedDate": "2010-11-26"}"#,
            r#"{"registration": "B", "firstUsedDate": "unknown"}"#,
        ]);
        let schema = infer_from_ndjson(&path).unwrap();
        let column = schema
            .columns
            .iter()
            .find(|c| c.name == "firstUsedDate")
            .unwrap();
        assert_eq!(column.sql_type, SqlType::Text);
    }

    #[test]
    fn test_all_null_column_falls_back_to_text() {
        let (_dir, path) = write_ndjson(&[r#"{"registration": "A", "model": null}"#]);
        let schema = infer_from_ndjson(&path).unwrap();
        let column = schema.columns.iter().find(|c| c.name == "model").unwrap();
        assert_eq!(column.sql_type, SqlType::Text);
    }

    #[test]
    fn test_later_keys_are_appended() {
        let (_dir, path) = write_ndjson(&[
            r#"{"registration": "A"}"#,
            r#"{"registration": "B", "modification": "DELETED"}"#,
        ]);
        let schema = infer_from_ndjson(&path).unwrap();
        assert!(schema.contains("modification"));
        assert_eq!(schema.columns.len(), 2);
    }

    #[test]
    fn test_empty_file_is_an_error() {
        let (_dir, path) = write_ndjson(&[]);
        assert!(infer_from_ndjson(&path).is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("2026-01-09").is_some());
        assert!(parse_date("09-01-2026").is_some());
        assert!(parse_date("2026.01.09").is_some());
        assert!(parse_date("2026.01.09 10:33:46").is_none());
        assert!(parse_date("unknown").is_none());
    }
}

// ABOUTME: Staged upsert engine: loads normalized periods into staging and merges by natural key
// ABOUTME: Builds dynamic INSERT/MERGE statements and batches within parameter limits

use std::cmp;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::config::WarehouseConfig;

use super::schema::{self, SqlType, TableSchema};
use super::validate_identifier;

/// Natural key every record carries; the merge is keyed on it.
const NATURAL_KEY: &str = "registration";
/// Change-type column delta records carry; bulk snapshots do not.
const MODIFICATION_COLUMN: &str = "modification";
/// Attribute the main table is range-partitioned on.
const PARTITION_COLUMN: &str = "lastMotTestDate";
/// PostgreSQL allows ~65535 parameters per statement; leave some margin.
const MAX_PARAMS: usize = 65_000;

/// Failures in the staged merge protocol. Surfaced to the caller; the
/// staging table is not guaranteed to be dropped on failure; the next
/// truncate-stage rebuilds it.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("warehouse statement failed: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("invalid identifier: {0}")]
    Identifier(String),
    #[error("schema autodetection failed: {0}")]
    Schema(String),
    #[error("staging is missing the natural key column {0:?}")]
    MissingKey(&'static str),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed record at {path:?} line {line}: {source}")]
    Malformed {
        path: PathBuf,
        line: u64,
        source: serde_json::Error,
    },
}

/// How a staging load treats prior staging contents.
///
/// `Append` exists so several periods can accumulate in staging before a
/// single merge pass (a weekly catch-up), avoiding one merge per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    Truncate,
    Append,
}

/// Reconciles normalized period files into the durable main table via a
/// transient staging table.
///
/// The warehouse client is an injected collaborator borrowed for the
/// uploader's lifetime. All statements run sequentially on it, which
/// serializes the merge against its staging/main pair.
pub struct Uploader<'a> {
    client: &'a Client,
    config: WarehouseConfig,
}

impl<'a> Uploader<'a> {
    /// Create an uploader, validating every identifier that will be
    /// spliced into SQL.
    pub fn new(client: &'a Client, config: WarehouseConfig) -> Result<Self, MergeError> {
        for name in [
            config.schema.as_str(),
            config.table.as_str(),
            &config.staging_table(),
            &format!("{}_default", config.table),
        ] {
            validate_identifier(name).map_err(|e| MergeError::Identifier(e.to_string()))?;
        }
        Ok(Self { client, config })
    }

    /// Load one normalized period file into the staging table.
    ///
    /// `Truncate` replaces the staging table with one shaped by this
    /// file's inferred schema; `Append` creates it only if missing and
    /// adds rows. Returns the number of rows staged.
    pub async fn stage(&self, file: &Path, mode: StageMode) -> Result<u64, MergeError> {
        let table_schema = infer(file)?;
        let staging = self.staging_ref();

        match mode {
            StageMode::Truncate => {
                self.client
                    .execute(&format!("DROP TABLE IF EXISTS {}", staging), &[])
                    .await?;
                self.client
                    .execute(&create_table_sql(&staging, &table_schema, false), &[])
                    .await?;
            }
            StageMode::Append => {
                self.client
                    .execute(&create_table_sql(&staging, &table_schema, true), &[])
                    .await?;
            }
        }

        let rows = self.load_rows(&staging, &table_schema, file).await?;
        tracing::info!("staged {} rows into {}", rows, staging);
        Ok(rows)
    }

    /// Reconcile staging into the main table with one `MERGE` statement,
    /// then drop staging.
    ///
    /// Per staged key: `DELETED` removes the matching main row; a match
    /// otherwise has its non-key columns replaced from staging; no match
    /// inserts (deletes of absent keys are no-ops). Safe to retry:
    /// staging is reproducibly rebuilt from the idempotently produced
    /// normalized files.
    pub async fn merge(&self) -> Result<u64, MergeError> {
        let staging_columns = self.table_columns(&self.config.staging_table()).await?;
        if staging_columns.is_empty() {
            return Err(MergeError::Schema(format!(
                "staging table {} does not exist; stage a period first",
                self.staging_ref()
            )));
        }
        let main_columns = self.table_columns(&self.config.table).await?;
        if main_columns.is_empty() {
            return Err(MergeError::Schema(format!(
                "main table {} does not exist; create it from a bulk snapshot first",
                self.main_ref()
            )));
        }

        // Staged columns the main table does not carry (the change-type
        // tag, typically) participate in the merge conditions but are
        // neither updated nor inserted.
        let shared: Vec<String> = staging_columns
            .iter()
            .filter(|c| main_columns.contains(*c))
            .cloned()
            .collect();
        if !shared.iter().any(|c| c == NATURAL_KEY) {
            return Err(MergeError::MissingKey(NATURAL_KEY));
        }
        let has_modification = staging_columns.iter().any(|c| c == MODIFICATION_COLUMN);

        tracing::info!("running merge into {}", self.main_ref());
        let query = build_merge_query(
            &self.main_ref(),
            &self.staging_ref(),
            &shared,
            has_modification,
        );
        let affected = self.client.execute(&query, &[]).await?;
        tracing::info!("merge complete - {} rows affected", affected);

        self.client
            .execute(&format!("DROP TABLE IF EXISTS {}", self.staging_ref()), &[])
            .await?;
        tracing::info!("dropped staging table {}", self.staging_ref());

        Ok(affected)
    }

    /// One-time full load of a bulk snapshot, establishing the baseline
    /// the merge protocol assumes.
    ///
    /// Replaces the main table, range-partitions it on the last-test-date
    /// attribute (with a default partition catching everything, NULLs
    /// included) and indexes the natural key. The index is not unique:
    /// per-key uniqueness is maintained by the merge protocol, not a
    /// constraint.
    pub async fn create_main_table(&self, file: &Path) -> Result<u64, MergeError> {
        let table_schema = infer(file)?;
        if !table_schema.contains(NATURAL_KEY) {
            return Err(MergeError::MissingKey(NATURAL_KEY));
        }

        let main = self.main_ref();
        self.client
            .execute(&format!("DROP TABLE IF EXISTS {} CASCADE", main), &[])
            .await?;

        if table_schema.contains(PARTITION_COLUMN) {
            let ddl = format!(
                "{} PARTITION BY RANGE ({})",
                create_table_sql(&main, &table_schema, false),
                quote_ident(PARTITION_COLUMN)
            );
            self.client.execute(&ddl, &[]).await?;

            let default_partition = format!(
                "\"{}\".\"{}_default\"",
                self.config.schema, self.config.table
            );
            self.client
                .execute(
                    &format!(
                        "CREATE TABLE {} PARTITION OF {} DEFAULT",
                        default_partition, main
                    ),
                    &[],
                )
                .await?;
        } else {
            tracing::warn!(
                "bulk file has no {:?} attribute; creating {} unpartitioned",
                PARTITION_COLUMN,
                main
            );
            self.client
                .execute(&create_table_sql(&main, &table_schema, false), &[])
                .await?;
        }

        self.client
            .execute(
                &format!(
                    "CREATE INDEX \"idx_{}_{}\" ON {} ({})",
                    self.config.table,
                    NATURAL_KEY,
                    main,
                    quote_ident(NATURAL_KEY)
                ),
                &[],
            )
            .await?;

        let rows = self.load_rows(&main, &table_schema, file).await?;
        tracing::info!("created {} with {} rows", main, rows);
        Ok(rows)
    }

    /// Unconditional append into the main table with no conflict check.
    ///
    /// Only meaningful for initial full loads against an assumed-empty
    /// table (further bulk parts after [`Self::create_main_table`]).
    pub async fn append(&self, file: &Path) -> Result<u64, MergeError> {
        let table_schema = infer(file)?;
        let rows = self.load_rows(&self.main_ref(), &table_schema, file).await?;
        tracing::info!("appended {} rows into {}", rows, self.main_ref());
        Ok(rows)
    }

    fn main_ref(&self) -> String {
        format!("\"{}\".\"{}\"", self.config.schema, self.config.table)
    }

    fn staging_ref(&self) -> String {
        format!(
            "\"{}\".\"{}\"",
            self.config.schema,
            self.config.staging_table()
        )
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, MergeError> {
        let rows = self
            .client
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&self.config.schema, &table],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Stream the file into `table_ref` in parameter-limit-aware batches.
    async fn load_rows(
        &self,
        table_ref: &str,
        table_schema: &TableSchema,
        file: &Path,
    ) -> Result<u64, MergeError> {
        let reader = BufReader::new(fs::File::open(file).map_err(|source| MergeError::Io {
            path: file.to_path_buf(),
            source,
        })?);

        let rows_per_batch = cmp::max(1, MAX_PARAMS / table_schema.columns.len());
        let mut batch: Vec<Vec<Box<dyn ToSql + Sync + Send>>> = Vec::with_capacity(rows_per_batch);
        let mut total = 0u64;
        let mut line_number = 0u64;

        for line in reader.lines() {
            line_number += 1;
            let line = line.map_err(|source| MergeError::Io {
                path: file.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }

            let value: serde_json::Value =
                serde_json::from_str(&line).map_err(|source| MergeError::Malformed {
                    path: file.to_path_buf(),
                    line: line_number,
                    source,
                })?;
            let object = match value {
                serde_json::Value::Object(object) => object,
                _ => {
                    return Err(MergeError::Schema(format!(
                        "expected a JSON object at {:?} line {}",
                        file, line_number
                    )))
                }
            };

            let row: Vec<Box<dyn ToSql + Sync + Send>> = table_schema
                .columns
                .iter()
                .map(|column| bind_value(object.get(&column.name), column.sql_type))
                .collect();
            batch.push(row);

            if batch.len() >= rows_per_batch {
                total += self
                    .insert_batch(table_ref, table_schema, std::mem::take(&mut batch))
                    .await?;
            }
        }

        if !batch.is_empty() {
            total += self.insert_batch(table_ref, table_schema, batch).await?;
        }

        Ok(total)
    }

    async fn insert_batch(
        &self,
        table_ref: &str,
        table_schema: &TableSchema,
        rows: Vec<Vec<Box<dyn ToSql + Sync + Send>>>,
    ) -> Result<u64, MergeError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let query = build_insert_query(table_ref, &table_schema.column_names(), rows.len());
        let params: Vec<&(dyn ToSql + Sync)> = rows
            .iter()
            .flat_map(|row| row.iter().map(|v| v.as_ref() as &(dyn ToSql + Sync)))
            .collect();

        let affected = self.client.execute(&query, &params).await?;
        Ok(affected)
    }
}

fn infer(file: &Path) -> Result<TableSchema, MergeError> {
    schema::infer_from_ndjson(file).map_err(|e| MergeError::Schema(e.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

fn create_table_sql(table_ref: &str, table_schema: &TableSchema, if_not_exists: bool) -> String {
    let columns = table_schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.ddl()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE{} {} ({})",
        if if_not_exists { " IF NOT EXISTS" } else { "" },
        table_ref,
        columns
    )
}

fn build_insert_query(table_ref: &str, columns: &[&str], row_count: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut placeholders = Vec::with_capacity(row_count);
    let mut param = 1usize;
    for _ in 0..row_count {
        let row = (0..columns.len())
            .map(|_| {
                let p = format!("${}", param);
                param += 1;
                p
            })
            .collect::<Vec<_>>()
            .join(", ");
        placeholders.push(format!("({})", row));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table_ref,
        column_list,
        placeholders.join(", ")
    )
}

/// Build the single reconciliation statement over (main, staging).
///
/// `columns` is the column set shared by main and staging; the
/// modification tag may live only in staging, so it is referenced
/// staging-qualified in the conditions and controlled by
/// `has_modification`. Arms are order-sensitive: the DELETE arm must
/// precede the catch-all UPDATE arm. Without a modification column (bulk
/// loads) the statement degenerates to a plain upsert.
fn build_merge_query(
    main_ref: &str,
    staging_ref: &str,
    columns: &[String],
    has_modification: bool,
) -> String {
    let key = quote_ident(NATURAL_KEY);
    let modification = quote_ident(MODIFICATION_COLUMN);

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_values = columns
        .iter()
        .map(|c| format!("s.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let update_set = columns
        .iter()
        .filter(|c| c.as_str() != NATURAL_KEY)
        .map(|c| format!("{} = s.{}", quote_ident(c), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query = format!(
        "MERGE INTO {} AS m\nUSING {} AS s\n  ON m.{} = s.{}\n",
        main_ref, staging_ref, key, key
    );

    if has_modification {
        query.push_str(&format!(
            "WHEN MATCHED AND s.{} = 'DELETED' THEN\n  DELETE\n",
            modification
        ));
    }

    if update_set.is_empty() {
        query.push_str("WHEN MATCHED THEN\n  DO NOTHING\n");
    } else {
        query.push_str(&format!("WHEN MATCHED THEN\n  UPDATE SET {}\n", update_set));
    }

    if has_modification {
        query.push_str(&format!(
            "WHEN NOT MATCHED AND (s.{} IS NULL OR s.{} <> 'DELETED') THEN\n  INSERT ({}) VALUES ({})",
            modification, modification, column_list, insert_values
        ));
    } else {
        query.push_str(&format!(
            "WHEN NOT MATCHED THEN\n  INSERT ({}) VALUES ({})",
            column_list, insert_values
        ));
    }

    query
}

/// Convert one JSON value into a bindable parameter for the column's
/// inferred type. Values that do not fit (outside the sampled shape)
/// bind as NULL rather than failing the batch.
fn bind_value(
    value: Option<&serde_json::Value>,
    sql_type: SqlType,
) -> Box<dyn ToSql + Sync + Send> {
    match sql_type {
        SqlType::Bigint => Box::new(value.and_then(|v| v.as_i64())),
        SqlType::Double => Box::new(value.and_then(|v| v.as_f64())),
        SqlType::Boolean => Box::new(value.and_then(|v| v.as_bool())),
        SqlType::Date => Box::new(
            value
                .and_then(|v| v.as_str())
                .and_then(schema::parse_date),
        ),
        SqlType::Text => Box::new(value.and_then(json_to_text)),
        SqlType::Jsonb => Box::new(value.cloned()),
    }
}

fn json_to_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_insert_query_numbering() {
        let query = build_insert_query("\"public\".\"t\"", &["a", "b"], 2);
        assert_eq!(
            query,
            "INSERT INTO \"public\".\"t\" (\"a\", \"b\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_create_table_sql() {
        let table_schema = TableSchema {
            columns: vec![
                schema::Column {
                    name: "registration".to_string(),
                    sql_type: SqlType::Text,
                },
                schema::Column {
                    name: "motTests".to_string(),
                    sql_type: SqlType::Jsonb,
                },
            ],
        };
        assert_eq!(
            create_table_sql("\"public\".\"t\"", &table_schema, false),
            "CREATE TABLE \"public\".\"t\" (\"registration\" TEXT, \"motTests\" JSONB)"
        );
        assert!(create_table_sql("\"public\".\"t\"", &table_schema, true)
            .starts_with("CREATE TABLE IF NOT EXISTS"));
    }

    #[test]
    fn test_merge_query_with_modification_column() {
        let query = build_merge_query(
            "\"public\".\"main\"",
            "\"public\".\"main_staging\"",
            &columns(&["registration", "make", "date"]),
            true,
        );

        assert!(query.starts_with("MERGE INTO \"public\".\"main\" AS m"));
        assert!(query.contains("ON m.\"registration\" = s.\"registration\""));
        assert!(query.contains("WHEN MATCHED AND s.\"modification\" = 'DELETED' THEN\n  DELETE"));
        assert!(query.contains("UPDATE SET \"make\" = s.\"make\", \"date\" = s.\"date\""));
        // The key column is never updated
        assert!(!query.contains("\"registration\" = s.\"registration\","));
        assert!(query.contains(
            "WHEN NOT MATCHED AND (s.\"modification\" IS NULL OR s.\"modification\" <> 'DELETED')"
        ));
        assert!(query.contains("INSERT (\"registration\", \"make\", \"date\")"));
    }

    #[test]
    fn test_merge_query_without_modification_column() {
        let query = build_merge_query(
            "\"public\".\"main\"",
            "\"public\".\"main_staging\"",
            &columns(&["registration", "make"]),
            false,
        );
        assert!(!query.contains("DELETE"));
        assert!(query.contains("WHEN NOT MATCHED THEN\n  INSERT"));
    }

    #[test]
    fn test_merge_query_key_only_staging_does_nothing_on_match() {
        let query = build_merge_query(
            "\"public\".\"main\"",
            "\"public\".\"main_staging\"",
            &columns(&["registration"]),
            true,
        );
        assert!(query.contains("WHEN MATCHED THEN\n  DO NOTHING"));
    }

    #[test]
    fn test_json_to_text_renders_scalars() {
        assert_eq!(json_to_text(&serde_json::json!(null)), None);
        assert_eq!(
            json_to_text(&serde_json::json!("hello")),
            Some("hello".to_string())
        );
        assert_eq!(json_to_text(&serde_json::json!(42)), Some("42".to_string()));
        assert_eq!(
            json_to_text(&serde_json::json!(true)),
            Some("true".to_string())
        );
    }

    #[test]
    fn test_json_to_text_renders_nested_values() {
        assert_eq!(
            json_to_text(&serde_json::json!({"k": 1})),
            Some("{\"k\":1}".to_string())
        );
    }
}

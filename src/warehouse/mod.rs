// ABOUTME: Warehouse access: connection helper, identifier validation, staged upsert engine
// ABOUTME: Exports the Uploader plus schema autodetection for NDJSON period files

pub mod schema;
pub mod uploader;

pub use uploader::{MergeError, StageMode, Uploader};

use anyhow::{bail, Context, Result};

/// Connect to the warehouse and drive the connection on a background
/// task. The returned client is the collaborator every engine component
/// borrows.
pub async fn connect(url: &str) -> Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .context("Failed to connect to warehouse")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("warehouse connection error: {}", e);
        }
    });

    Ok(client)
}

/// Validate an identifier before it is spliced into SQL.
///
/// Table and schema names cannot be bound as parameters, so anything that
/// ends up inside DDL/DML text has to pass this first.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Identifier cannot be empty");
    }
    if name.len() > 63 {
        bail!("Identifier '{}' exceeds 63 characters", name);
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !(first.is_ascii_alphabetic() || first == '_') {
        bail!("Identifier '{}' must start with a letter or underscore", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!(
            "Identifier '{}' may only contain letters, digits and underscores",
            name
        );
    }
    Ok(())
}

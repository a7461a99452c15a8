// ABOUTME: Explicit configuration structs injected into each component
// ABOUTME: Resolves default data and token-cache paths under the user's home

use anyhow::Result;
use std::path::PathBuf;

pub const DEFAULT_MANIFEST_URL: &str =
    "https://history.mot.api.gov.uk/v1/trade/vehicles/bulk-download";

/// Credentials and endpoints for the identity provider.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub scope: String,
    /// Where the serialized token cache lives.
    pub cache_path: PathBuf,
}

/// Manifest endpoint and its API key.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub manifest_url: String,
    pub api_key: String,
}

/// Destination warehouse coordinates.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    pub schema: String,
    pub table: String,
}

impl WarehouseConfig {
    /// Staging table name: main table name plus a fixed suffix.
    pub fn staging_table(&self) -> String {
        format!("{}_staging", self.table)
    }
}

/// Full configuration for one synchronization run.
///
/// There is no ambient/global state: every component takes the section it
/// needs through its constructor.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub auth: AuthConfig,
    pub feed: FeedConfig,
    /// Directory holding downloaded archives, period directories and
    /// normalized per-period output files.
    pub data_dir: PathBuf,
    pub warehouse: WarehouseConfig,
}

fn home_subdir(name: &str) -> Result<PathBuf> {
    let home_dir =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home_dir.join(".mot-warehouse-sync").join(name))
}

/// Default location for the persisted token cache.
pub fn default_cache_path() -> Result<PathBuf> {
    home_subdir("token-cache.json")
}

/// Default location for downloaded and normalized feed data.
pub fn default_data_dir() -> Result<PathBuf> {
    home_subdir("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_table_name() {
        let config = WarehouseConfig {
            url: "postgresql://user@localhost/warehouse".to_string(),
            schema: "public".to_string(),
            table: "mot_history".to_string(),
        };
        assert_eq!(config.staging_table(), "mot_history_staging");
    }
}

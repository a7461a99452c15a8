// ABOUTME: Persisted, expiry-aware access-token cache with silent and forced refresh paths
// ABOUTME: Expiry is judged from the cache file contents so it can be checked without a live session

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::AuthConfig;

/// Seconds subtracted from the recorded expiry before a token counts as
/// usable, so a token never expires mid-request.
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Authentication failures are fatal to a run; there is no internal retry.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials: client id, client secret and token URL are all required")]
    MissingCredentials,
    #[error("identity provider unreachable: {0}")]
    Provider(#[from] reqwest::Error),
    #[error("token exchange failed with status {status}: {body}")]
    Exchange {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("token cache I/O at {path:?}: {source}")]
    Cache {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("token cache serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A bearer token. Replaced wholesale on refresh, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token is expired at `now`, applying the safety buffer.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(EXPIRY_BUFFER_SECS)
    }
}

/// The persisted cache blob. Read at startup, rewritten on any change.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    token: AccessToken,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

/// Process-wide token cache backed by a JSON file.
///
/// `acquire` serves from the persisted cache when the stored token is
/// still inside its validity window; otherwise (or when forced) it runs a
/// client-credentials exchange and rewrites the cache. The persisted file
/// is last-writer-wins across concurrent processes.
pub struct TokenCache {
    config: AuthConfig,
    http: reqwest::Client,
    current: Option<AccessToken>,
}

impl TokenCache {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        if config.client_id.is_empty()
            || config.client_secret.is_empty()
            || config.token_url.is_empty()
        {
            return Err(AuthError::MissingCredentials);
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            config,
            http,
            current: None,
        })
    }

    /// Get a valid access token.
    ///
    /// Unless `force_refresh` is set, attempts silent acquisition from the
    /// persisted cache first. A cache miss, parse error, expired entry, or
    /// `force_refresh` all fall through to a fresh client-credentials
    /// exchange; any successful exchange is persisted before returning.
    pub async fn acquire(&mut self, force_refresh: bool) -> Result<AccessToken, AuthError> {
        if !force_refresh {
            if let Some(token) = self.silent() {
                tracing::debug!("access token served from cache");
                self.current = Some(token.clone());
                return Ok(token);
            }
        }

        let token = self.exchange().await?;
        self.persist(&token)?;
        tracing::info!(
            "acquired fresh access token (expires {})",
            token.expires_at.to_rfc3339()
        );
        self.current = Some(token.clone());
        Ok(token)
    }

    /// Check the persisted cache for token expiry without a live session.
    ///
    /// Missing, unreadable or unparseable cache files all count as
    /// expired.
    pub fn expired_on_disk(&self) -> bool {
        match self.read_entry() {
            Some(entry) => entry.token.is_expired_at(Utc::now()),
            None => true,
        }
    }

    /// Remove both the in-memory token and the persisted cache file.
    ///
    /// Used to force re-authentication after repeated failures.
    pub fn clear(&mut self) -> Result<(), AuthError> {
        self.current = None;
        let path = &self.config.cache_path;
        if path.exists() {
            fs::remove_file(path).map_err(|source| AuthError::Cache {
                path: path.clone(),
                source,
            })?;
            tracing::info!("token cache cleared at {:?}", path);
        }
        Ok(())
    }

    fn silent(&self) -> Option<AccessToken> {
        let entry = self.read_entry()?;
        if entry.token.scope != self.config.scope {
            tracing::debug!("cached token scope does not match, ignoring");
            return None;
        }
        // Expiry comes from the file contents, not from in-memory state.
        if entry.token.is_expired_at(Utc::now()) {
            return None;
        }
        Some(entry.token)
    }

    fn read_entry(&self) -> Option<CacheEntry> {
        let path = &self.config.cache_path;
        if !path.exists() {
            return None;
        }
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("failed to read token cache {:?}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("failed to parse token cache {:?}: {}", path, e);
                None
            }
        }
    }

    async fn exchange(&self) -> Result<AccessToken, AuthError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", self.config.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange { status, body });
        }

        let parsed: TokenResponse = response.json().await?;
        let issued_at = Utc::now();
        Ok(AccessToken {
            value: parsed.access_token,
            scope: parsed.scope.unwrap_or_else(|| self.config.scope.clone()),
            expires_at: issued_at + Duration::seconds(parsed.expires_in),
            issued_at,
        })
    }

    fn persist(&self, token: &AccessToken) -> Result<(), AuthError> {
        let path = &self.config.cache_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| AuthError::Cache {
                path: path.clone(),
                source,
            })?;
        }
        let entry = CacheEntry {
            token: token.clone(),
        };
        let contents = serde_json::to_string_pretty(&entry)?;
        fs::write(path, contents).map_err(|source| AuthError::Cache {
            path: path.clone(),
            source,
        })?;
        tracing::debug!("token cache saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(cache_path: PathBuf) -> AuthConfig {
        AuthConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            token_url: "https://login.example.com/tenant/oauth2/v2.0/token".to_string(),
            scope: "https://feed.example.com/.default".to_string(),
            cache_path,
        }
    }

    fn token_expiring_in(secs: i64, scope: &str) -> AccessToken {
        let now = Utc::now();
        AccessToken {
            value: "tok".to_string(),
            scope: scope.to_string(),
            expires_at: now + Duration::seconds(secs),
            issued_at: now,
        }
    }

    #[test]
    fn test_token_inside_buffer_is_expired() {
        let token = token_expiring_in(30, "s");
        assert!(token.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_token_outside_buffer_is_valid() {
        let token = token_expiring_in(120, "s");
        assert!(!token.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_new_rejects_missing_credentials() {
        let mut config = test_config(PathBuf::from("unused.json"));
        config.client_secret = String::new();
        assert!(matches!(
            TokenCache::new(config),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn test_expired_on_disk_when_cache_missing() {
        let dir = tempdir().unwrap();
        let cache = TokenCache::new(test_config(dir.path().join("cache.json"))).unwrap();
        assert!(cache.expired_on_disk());
    }

    #[test]
    fn test_expired_on_disk_when_cache_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json").unwrap();
        let cache = TokenCache::new(test_config(path)).unwrap();
        assert!(cache.expired_on_disk());
    }

    #[test]
    fn test_persist_and_silent_round_trip() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().join("cache.json"));
        let cache = TokenCache::new(config.clone()).unwrap();

        let token = token_expiring_in(3600, &config.scope);
        cache.persist(&token).unwrap();

        assert!(!cache.expired_on_disk());
        let silent = cache.silent().unwrap();
        assert_eq!(silent.value, token.value);
        assert_eq!(silent.scope, token.scope);
    }

    #[test]
    fn test_silent_ignores_scope_mismatch() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().join("cache.json"));
        let cache = TokenCache::new(config).unwrap();

        let token = token_expiring_in(3600, "some-other-scope");
        cache.persist(&token).unwrap();
        assert!(cache.silent().is_none());
    }

    #[test]
    fn test_silent_ignores_expired_entry() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().join("cache.json"));
        let cache = TokenCache::new(config.clone()).unwrap();

        let token = token_expiring_in(30, &config.scope);
        cache.persist(&token).unwrap();
        assert!(cache.silent().is_none());
        assert!(cache.expired_on_disk());
    }

    #[test]
    fn test_clear_removes_cache_file() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().join("cache.json"));
        let mut cache = TokenCache::new(config.clone()).unwrap();

        let token = token_expiring_in(3600, &config.scope);
        cache.persist(&token).unwrap();
        assert!(config.cache_path.exists());

        cache.clear().unwrap();
        assert!(!config.cache_path.exists());
        assert!(cache.expired_on_disk());
    }
}

pub mod retry;
pub mod s3_backend;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use s3_backend::S3Backend;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage configuration: {0}")]
    Config(String),

    #[error("{op}: {message}")]
    Request { op: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Retry settings for remote requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// One object returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the store's root prefix.
    pub key: String,
    pub size: u64,
}

/// Flat key/object store holding whole archive files.
///
/// Keys are relative to the store's root prefix. Implementations must make
/// `put_file` safe to repeat (same key is overwritten) and `delete` of a
/// missing key a success.
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` under `key`, returning the stored size.
    fn put_file(&self, key: &str, path: &Path) -> Result<u64>;

    /// List all objects whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete an object. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Human-readable location, e.g. `s3.example.com/bucket`.
    fn describe(&self) -> String;
}

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Endpoint URL or bare host name (bare hosts get `https://`).
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Key prefix inside the bucket.
    pub root: String,
    /// Allow plaintext HTTP endpoints.
    pub allow_insecure_http: bool,
    pub retry: RetryConfig,
}

/// Normalise an endpoint: bare host names become `https://host`.
pub fn normalize_endpoint(endpoint: &str, allow_insecure_http: bool) -> Result<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(StorageError::Config("S3 endpoint is empty".into()));
    }
    if let Some(rest) = endpoint.strip_prefix("http://") {
        if !allow_insecure_http {
            return Err(StorageError::Config(format!(
                "refusing plaintext HTTP endpoint 'http://{rest}' (set allow_insecure_http to override)"
            )));
        }
        return Ok(endpoint.to_string());
    }
    if endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    if endpoint.contains("://") {
        return Err(StorageError::Config(format!(
            "unsupported S3 endpoint scheme in '{endpoint}'"
        )));
    }
    Ok(format!("https://{endpoint}"))
}

/// Build an object store from its configuration.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn ObjectStore>> {
    let endpoint = normalize_endpoint(&cfg.endpoint, cfg.allow_insecure_http)?;
    if cfg.bucket.is_empty() {
        return Err(StorageError::Config("S3 bucket name is empty".into()));
    }
    if cfg.access_key_id.is_empty() || cfg.secret_access_key.is_empty() {
        return Err(StorageError::Config(format!(
            "S3 credentials missing for bucket '{}'",
            cfg.bucket
        )));
    }
    let backend = S3Backend::new(
        &cfg.bucket,
        &cfg.region,
        &cfg.root,
        &endpoint,
        &cfg.access_key_id,
        &cfg.secret_access_key,
        cfg.retry.clone(),
    )?;
    Ok(Box::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_https() {
        assert_eq!(
            normalize_endpoint("s3.example.com", false).unwrap(),
            "https://s3.example.com"
        );
        assert_eq!(
            normalize_endpoint("https://s3.example.com/", false).unwrap(),
            "https://s3.example.com"
        );
    }

    #[test]
    fn plaintext_http_needs_opt_in() {
        assert!(normalize_endpoint("http://minio:9000", false).is_err());
        assert_eq!(
            normalize_endpoint("http://minio:9000", true).unwrap(),
            "http://minio:9000"
        );
    }

    #[test]
    fn unknown_scheme_rejected() {
        let err = normalize_endpoint("ftp://host", true).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn missing_credentials_rejected() {
        let cfg = StorageConfig {
            endpoint: "s3.example.com".into(),
            bucket: "acme".into(),
            region: "us-east-1".into(),
            access_key_id: String::new(),
            secret_access_key: "secret".into(),
            root: String::new(),
            allow_insecure_http: false,
            retry: RetryConfig::default(),
        };
        let err = backend_from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("credentials"));
    }

    #[test]
    fn retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_delay_ms, 1000);
        assert_eq!(retry.retry_max_delay_ms, 60_000);
    }
}

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::retry::{HttpRetryError, retry_http};
use crate::{ObjectInfo, ObjectStore, Result, RetryConfig, StorageError};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    endpoint: String,
    region: String,
    /// Prefix (root path) prepended to all keys.
    root: String,
    bucket_checked: AtomicBool,
}

impl S3Backend {
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint.parse().map_err(|e| {
            StorageError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;
        let region = if region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            region.to_string()
        };

        // Self-hosted endpoints rarely resolve virtual-host bucket names.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.clone(),
        )
        .map_err(|e| StorageError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            retry,
            endpoint: endpoint.to_string(),
            region,
            root: root.trim_matches('/').to_string(),
            bucket_checked: AtomicBool::new(false),
        })
    }

    /// Prepend the root prefix to a key.
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, HttpRetryError>,
    ) -> std::result::Result<T, HttpRetryError> {
        retry_http(&self.retry, op_name, "S3", f)
    }

    fn request_error(op: String, e: HttpRetryError) -> StorageError {
        StorageError::Request {
            op,
            message: e.to_string(),
        }
    }

    /// Create the bucket unless it already exists. Checked once per backend.
    pub fn ensure_bucket(&self) -> Result<()> {
        if self.bucket_checked.load(Ordering::Acquire) {
            return Ok(());
        }
        let name = self.bucket.name().to_string();
        let head_url = self
            .bucket
            .head_bucket(Some(&self.credentials))
            .sign(PRESIGN_DURATION);

        let exists = match self.retry_call(&format!("HEAD bucket {name}"), || {
            self.agent
                .head(head_url.as_str())
                .call()
                .map_err(HttpRetryError::http)
        }) {
            Ok(_) => true,
            Err(e) if e.status() == Some(404) => false,
            Err(e) => return Err(Self::request_error(format!("S3 HEAD bucket {name}"), e)),
        };

        if !exists {
            tracing::info!("S3 bucket '{name}' does not exist, creating it");
            let create_url = self
                .bucket
                .create_bucket(&self.credentials)
                .sign(PRESIGN_DURATION);
            let body = if self.region == DEFAULT_REGION {
                String::new()
            } else {
                format!(
                    "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                     <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                    self.region
                )
            };
            self.retry_call(&format!("CREATE bucket {name}"), || {
                self.agent
                    .put(create_url.as_str())
                    .send_string(&body)
                    .map_err(HttpRetryError::http)
            })
            .map_err(|e| Self::request_error(format!("S3 CREATE bucket {name}"), e))?;
        }

        self.bucket_checked.store(true, Ordering::Release);
        Ok(())
    }
}

impl ObjectStore for S3Backend {
    fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        self.ensure_bucket()?;

        let len = std::fs::metadata(path)?.len();
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        // Reopen on every attempt so a retry never resumes a half-read file.
        self.retry_call(&format!("PUT {key}"), || {
            let file = File::open(path).map_err(HttpRetryError::Io)?;
            self.agent
                .put(url.as_str())
                .set("Content-Length", &len.to_string())
                .send(file)
                .map_err(HttpRetryError::http)
        })
        .map_err(|e| Self::request_error(format!("S3 PUT {key}"), e))?;

        tracing::debug!("S3 PUT {key}: {len} bytes");
        Ok(len)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let parsed = match self.retry_call(&format!("LIST {prefix}"), || {
                let resp = self
                    .agent
                    .get(url.as_str())
                    .call()
                    .map_err(HttpRetryError::http)?;
                let mut body = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut body)
                    .map_err(HttpRetryError::Io)?;
                ListObjectsV2::parse_response(&body).map_err(|e| {
                    HttpRetryError::Permanent(format!("failed to parse response: {e}"))
                })
            }) {
                Ok(parsed) => parsed,
                // A bucket that was never created holds no archives.
                Err(e) if e.status() == Some(404) => return Ok(Vec::new()),
                Err(e) => return Err(Self::request_error(format!("S3 LIST {prefix}"), e)),
            };

            for obj in &parsed.contents {
                let key = &obj.key;
                if key.ends_with('/') {
                    continue;
                }
                let relative = if root_prefix_len > 0 && key.len() > root_prefix_len {
                    key[root_prefix_len..].to_string()
                } else {
                    key.clone()
                };
                objects.push(ObjectInfo {
                    key: relative,
                    size: obj.size,
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("DELETE {key}"), || {
            self.agent
                .delete(url.as_str())
                .call()
                .map_err(HttpRetryError::http)
        }) {
            Ok(_) => Ok(()),
            Err(e) if e.status() == Some(404) => {
                tracing::debug!("S3 DELETE {key}: already absent");
                Ok(())
            }
            Err(e) => Err(Self::request_error(format!("S3 DELETE {key}"), e)),
        }
    }

    fn describe(&self) -> String {
        let host = self
            .endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.endpoint);
        if self.root.is_empty() {
            format!("{host}/{}", self.bucket.name())
        } else {
            format!("{host}/{}/{}", self.bucket.name(), self.root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(root: &str) -> S3Backend {
        S3Backend::new(
            "acme",
            "",
            root,
            "https://s3.example.com",
            "AKID",
            "SECRET",
            RetryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn root_prefix_applied_to_keys() {
        let b = backend("/site/backups/");
        assert_eq!(b.full_key("a.tar.gz"), "site/backups/a.tar.gz");
        assert_eq!(backend("").full_key("a.tar.gz"), "a.tar.gz");
    }

    #[test]
    fn empty_region_defaults() {
        assert_eq!(backend("").region, DEFAULT_REGION);
    }

    #[test]
    fn describe_names_host_and_bucket() {
        assert_eq!(backend("").describe(), "s3.example.com/acme");
        assert_eq!(backend("nightly").describe(), "s3.example.com/acme/nightly");
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let err = S3Backend::new(
            "acme",
            "us-east-1",
            "",
            "not a url",
            "AKID",
            "SECRET",
            RetryConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}

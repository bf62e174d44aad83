use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use sitebackup_storage::{RetryConfig, StorageConfig};

use super::defaults::*;
use crate::archive::ArchiveCompression;
use crate::source::{DatabaseCredentials, Instance};
use crate::thinning::ThinningStrategy;

/// On-disk YAML document. Every field is optional; command-line flags fill
/// in or override what is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Instance identifier used in archive names.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub database: DatabaseSection,
    /// Parent directory for the per-run scratch directory.
    #[serde(default)]
    pub scratch_dir: Option<String>,
    #[serde(default)]
    pub compression: Option<ArchiveCompression>,
    #[serde(default)]
    pub compression_level: Option<i32>,
    /// Local directory receiving a copy of every archive.
    #[serde(default)]
    pub attic: Option<String>,
    #[serde(default)]
    pub thinning: Option<String>,
    #[serde(default)]
    pub object_stores: Vec<ObjectStoreEntry>,
    #[serde(default)]
    pub mail: Option<MailSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Only tables starting with this prefix are dumped.
    pub prefix: Option<String>,
    /// Shell command whose stdout is the dump; replaces `mysqldump`.
    pub dump_command: Option<String>,
    #[serde(default = "default_dump_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            name: None,
            host: None,
            port: None,
            user: None,
            password: None,
            prefix: None,
            dump_command: None,
            timeout_secs: default_dump_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreEntry {
    /// Target name shown in reports.
    #[serde(default = "default_store_name")]
    pub name: String,
    /// Endpoint URL or bare host name.
    pub endpoint: String,
    /// Defaults to the instance identifier.
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Key prefix inside the bucket.
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub allow_insecure_http: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailSection {
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    /// Also send the report to the instance's admin address.
    #[serde(default)]
    pub to_admin: bool,
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
}

/// Database values given on the command line. Each one overrides the
/// config file and whatever the instance itself declares.
#[derive(Debug, Clone, Default)]
pub struct DatabaseOverrides {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub prefix: Option<String>,
    pub command: Option<String>,
}

/// A single S3 target described on the command line.
#[derive(Debug, Clone, Default)]
pub struct S3Override {
    pub host: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
}

/// Values taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Instance root directory.
    pub path: PathBuf,
    pub include_database: bool,
    pub include_filesystem: bool,
    pub dry_run: bool,
    pub label: Option<String>,
    pub thinning: Option<String>,
    pub attic: Option<String>,
    pub compression: Option<ArchiveCompression>,
    pub scratch_dir: Option<String>,
    pub database: DatabaseOverrides,
    pub s3: Option<S3Override>,
    pub mail_from: Option<String>,
    pub mail_to: Vec<String>,
    pub mail_to_admin: bool,
}

/// How the database dump is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpSource {
    Mysql(DatabaseCredentials),
    Command(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub source: DumpSource,
    pub timeout_secs: u64,
}

/// A configured S3 target.
#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub name: String,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub from: String,
    pub to: Vec<String>,
    pub sendmail: PathBuf,
}

/// Fully resolved, read-only settings for one run.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub instance: Instance,
    pub include_database: bool,
    pub include_filesystem: bool,
    /// Present whenever `include_database` is set.
    pub database: Option<DatabaseSettings>,
    pub scratch_dir: PathBuf,
    pub compression: ArchiveCompression,
    pub compression_level: Option<i32>,
    pub attic: Option<PathBuf>,
    pub object_stores: Vec<ObjectStoreSettings>,
    pub thinning: ThinningStrategy,
    pub dry_run: bool,
    pub mail: Option<MailSettings>,
}

impl FileConfig {
    pub(super) fn compression_or_default(&self) -> ArchiveCompression {
        self.compression.unwrap_or_else(default_compression)
    }

    pub(super) fn thinning_or_default(&self) -> String {
        self.thinning.clone().unwrap_or_else(default_thinning)
    }
}

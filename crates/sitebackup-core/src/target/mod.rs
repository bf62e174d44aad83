pub mod local;
pub mod object_storage;

use chrono::{DateTime, Utc};

use crate::archive::{ArchiveName, BackupArchive};
use crate::config::BackupConfig;
use crate::error::Result;

pub use self::local::LocalTarget;
pub use self::object_storage::ObjectStorageTarget;

/// An archive held by a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArchiveRef {
    /// Target-scoped name (the archive file name).
    pub key: String,
    pub created: DateTime<Utc>,
    pub size: u64,
    /// Name of the target holding it.
    pub target: String,
}

impl StoredArchiveRef {
    /// Reference for a listed key, if it is an archive of `instance`.
    pub fn from_listing(target: &str, instance: &str, key: &str, size: u64) -> Option<Self> {
        let name = ArchiveName::parse(key)?;
        if name.instance != instance {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            created: name.created,
            size,
            target: target.to_string(),
        })
    }

    /// The reference `archive` gets once stored on `target`.
    pub fn for_archive(target: &str, archive: &BackupArchive) -> Self {
        Self {
            key: archive.file_name(),
            created: archive.created(),
            size: archive.size,
            target: target.to_string(),
        }
    }
}

/// A destination for archives.
///
/// `store` may be repeated after a failure; it overwrites the same key.
/// `delete` of an absent archive succeeds.
pub trait Target {
    fn name(&self) -> &str;

    /// Where the archives go, for reports.
    fn describe(&self) -> String;

    fn store(&self, archive: &BackupArchive) -> Result<StoredArchiveRef>;

    /// Archives of this instance currently held, in no particular order.
    fn list(&self) -> Result<Vec<StoredArchiveRef>>;

    fn delete(&self, stored: &StoredArchiveRef) -> Result<()>;

    /// Whether old archives may be removed by thinning.
    fn supports_thinning(&self) -> bool;
}

/// Build all configured targets: the local attic first, then object stores
/// in configuration order.
pub fn targets_from_config(config: &BackupConfig) -> Result<Vec<Box<dyn Target>>> {
    let mut targets: Vec<Box<dyn Target>> = Vec::new();
    let instance = &config.instance.slug;

    if let Some(dir) = &config.attic {
        targets.push(Box::new(LocalTarget::new("local", dir, instance)));
    }

    for store in &config.object_stores {
        let backend = sitebackup_storage::backend_from_config(&store.storage)?;
        targets.push(Box::new(ObjectStorageTarget::new(
            &store.name,
            instance,
            backend,
        )));
    }

    Ok(targets)
}

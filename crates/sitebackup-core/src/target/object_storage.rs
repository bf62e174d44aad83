use sitebackup_storage::ObjectStore;

use super::{StoredArchiveRef, Target};
use crate::archive::BackupArchive;
use crate::error::{BackupError, Result};

/// Remote target backed by an [`ObjectStore`] (one per configured bucket).
pub struct ObjectStorageTarget {
    name: String,
    instance: String,
    store: Box<dyn ObjectStore>,
}

impl ObjectStorageTarget {
    pub fn new(name: &str, instance: &str, store: Box<dyn ObjectStore>) -> Self {
        Self {
            name: name.to_string(),
            instance: instance.to_string(),
            store,
        }
    }

    /// Listing prefix matching this instance's archive names.
    fn prefix(&self) -> String {
        format!("{}-", self.instance)
    }
}

impl Target for ObjectStorageTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        self.store.describe()
    }

    fn store(&self, archive: &BackupArchive) -> Result<StoredArchiveRef> {
        let key = archive.file_name();
        let size = self
            .store
            .put_file(&key, &archive.path)
            .map_err(|e| BackupError::transfer(&self.name, e))?;

        if size != archive.size {
            return Err(BackupError::transfer(
                &self.name,
                format!("uploaded {size} bytes of {key}, expected {}", archive.size),
            ));
        }

        tracing::info!("uploaded {key} to {}", self.store.describe());
        Ok(StoredArchiveRef::for_archive(&self.name, archive))
    }

    fn list(&self) -> Result<Vec<StoredArchiveRef>> {
        let objects = self
            .store
            .list(&self.prefix())
            .map_err(|e| BackupError::thinning(&self.name, e))?;

        let mut refs = Vec::with_capacity(objects.len());
        for object in objects {
            match StoredArchiveRef::from_listing(&self.name, &self.instance, &object.key, object.size)
            {
                Some(stored) => refs.push(stored),
                None => tracing::debug!("{}: ignoring foreign key '{}'", self.name, object.key),
            }
        }
        Ok(refs)
    }

    fn delete(&self, stored: &StoredArchiveRef) -> Result<()> {
        self.store
            .delete(&stored.key)
            .map_err(|e| BackupError::thinning(&self.name, e))
    }

    fn supports_thinning(&self) -> bool {
        true
    }
}

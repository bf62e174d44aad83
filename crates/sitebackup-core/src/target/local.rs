use std::fs;
use std::path::{Path, PathBuf};

use super::{StoredArchiveRef, Target};
use crate::archive::BackupArchive;
use crate::error::{BackupError, Result};

/// Keeps a copy of each archive in a local directory (the "attic").
///
/// Local copies are never thinned; the operator manages them by hand.
pub struct LocalTarget {
    name: String,
    dir: PathBuf,
    instance: String,
}

impl LocalTarget {
    pub fn new(name: &str, dir: &Path, instance: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            instance: instance.to_string(),
        }
    }

    /// Where an archive with this file name lives.
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn transfer_error(&self, message: impl ToString) -> BackupError {
        BackupError::transfer(&self.name, message)
    }

    /// Copy into a temp file next to the destination, then rename into place
    /// so a half-copied archive never carries the final name.
    fn atomic_copy(&self, src: &Path, dest: &Path) -> std::io::Result<u64> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.dir)?;
        let mut reader = fs::File::open(src)?;
        let copied = std::io::copy(&mut reader, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(copied)
    }
}

impl Target for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn store(&self, archive: &BackupArchive) -> Result<StoredArchiveRef> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            self.transfer_error(format!("cannot create '{}': {e}", self.dir.display()))
        })?;

        let dest = self.path_for(&archive.file_name());
        let size = self
            .atomic_copy(&archive.path, &dest)
            .map_err(|e| self.transfer_error(format!("copy to '{}': {e}", dest.display())))?;

        tracing::info!("stored {} in {}", archive.file_name(), self.dir.display());
        Ok(StoredArchiveRef {
            size,
            ..StoredArchiveRef::for_archive(&self.name, archive)
        })
    }

    fn list(&self) -> Result<Vec<StoredArchiveRef>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(self.transfer_error(format!(
                    "cannot list '{}': {e}",
                    self.dir.display()
                )));
            }
        };

        let mut refs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.transfer_error(e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().map_err(|e| self.transfer_error(e))?;
            if !meta.is_file() {
                continue;
            }
            match StoredArchiveRef::from_listing(&self.name, &self.instance, &file_name, meta.len())
            {
                Some(stored) => refs.push(stored),
                None => tracing::debug!("{}: ignoring '{file_name}'", self.name),
            }
        }
        Ok(refs)
    }

    fn delete(&self, stored: &StoredArchiveRef) -> Result<()> {
        if stored.key.contains('/') || stored.key.contains('\\') || stored.key.starts_with('.') {
            return Err(self.transfer_error(format!("unsafe archive key '{}'", stored.key)));
        }
        match fs::remove_file(self.path_for(&stored.key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.transfer_error(format!("delete '{}': {e}", stored.key))),
        }
    }

    fn supports_thinning(&self) -> bool {
        false
    }
}

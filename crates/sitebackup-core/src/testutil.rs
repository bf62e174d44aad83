use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use sitebackup_storage::{ObjectInfo, ObjectStore, StorageError};

use crate::archive::{ArchiveCompression, ArchiveName, BackupArchive};
use crate::database::DatabaseDumper;
use crate::error::{BackupError, Result};
use crate::mail::{MailMessage, MailTransport};
use crate::target::{StoredArchiveRef, Target};

pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

/// Reference to an archive of `instance` taken at `created`.
pub fn archive_ref(instance: &str, created: DateTime<Utc>, target: &str) -> StoredArchiveRef {
    let name = ArchiveName::new(instance, created, ArchiveCompression::Gzip);
    StoredArchiveRef {
        key: name.file_name(),
        created,
        size: 100,
        target: target.to_string(),
    }
}

/// Archive metadata pointing at `path` (which need not exist).
pub fn fake_archive(instance: &str, created: DateTime<Utc>, path: &Path) -> BackupArchive {
    BackupArchive {
        name: ArchiveName::new(instance, created, ArchiveCompression::Gzip),
        path: path.to_path_buf(),
        size: 100,
        checksum: None,
    }
}

/// Dumper returning fixed bytes.
pub struct StaticDumper(pub Vec<u8>);

impl DatabaseDumper for StaticDumper {
    fn describe(&self) -> String {
        "static".into()
    }

    fn dump(&self) -> Result<Vec<u8>> {
        if self.0.is_empty() {
            return Err(BackupError::Dump("produced empty output".into()));
        }
        Ok(self.0.clone())
    }
}

pub struct FailingDumper;

impl DatabaseDumper for FailingDumper {
    fn describe(&self) -> String {
        "failing".into()
    }

    fn dump(&self) -> Result<Vec<u8>> {
        Err(BackupError::Dump("mysqldump exited with code 2".into()))
    }
}

#[derive(Debug, Default)]
pub struct TargetState {
    /// Every call in order: `store:<key>`, `list`, `delete:<key>`.
    pub calls: Vec<String>,
    pub listing: Vec<StoredArchiveRef>,
    pub fail_store: bool,
    pub fail_list: bool,
    pub fail_delete: bool,
}

impl TargetState {
    pub fn count(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// Target double that records calls and can be told to fail.
pub struct RecordingTarget {
    name: String,
    thinning: bool,
    state: Arc<Mutex<TargetState>>,
}

impl RecordingTarget {
    pub fn new(name: &str, thinning: bool) -> (Self, Arc<Mutex<TargetState>>) {
        let state = Arc::new(Mutex::new(TargetState::default()));
        (
            Self {
                name: name.to_string(),
                thinning,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Target for RecordingTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    fn store(&self, archive: &BackupArchive) -> Result<StoredArchiveRef> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("store:{}", archive.file_name()));
        if state.fail_store {
            return Err(BackupError::transfer(&self.name, "connection reset by peer"));
        }
        let stored = StoredArchiveRef::for_archive(&self.name, archive);
        state.listing.retain(|r| r.key != stored.key);
        state.listing.push(stored.clone());
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<StoredArchiveRef>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("list".into());
        if state.fail_list {
            return Err(BackupError::thinning(&self.name, "403 Forbidden"));
        }
        Ok(state.listing.clone())
    }

    fn delete(&self, stored: &StoredArchiveRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{}", stored.key));
        if state.fail_delete {
            return Err(BackupError::thinning(&self.name, "500 Internal Server Error"));
        }
        state.listing.retain(|r| r.key != stored.key);
        Ok(())
    }

    fn supports_thinning(&self) -> bool {
        self.thinning
    }
}

#[derive(Debug, Default)]
pub struct StoreState {
    pub objects: BTreeMap<String, u64>,
    pub puts: Vec<String>,
    pub deletes: Vec<String>,
    pub fail_put: bool,
}

/// In-memory object store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, size: u64) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), size);
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }
}

impl ObjectStore for MemoryStore {
    fn put_file(&self, key: &str, path: &Path) -> sitebackup_storage::Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.puts.push(key.to_string());
        if state.fail_put {
            return Err(StorageError::Request {
                op: format!("PUT {key}"),
                message: "503 Service Unavailable".into(),
            });
        }
        let size = std::fs::metadata(path)?.len();
        state.objects.insert(key.to_string(), size);
        Ok(size)
    }

    fn list(&self, prefix: &str) -> sitebackup_storage::Result<Vec<ObjectInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, size)| ObjectInfo {
                key: k.clone(),
                size: *size,
            })
            .collect())
    }

    fn delete(&self, key: &str) -> sitebackup_storage::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deletes.push(key.to_string());
        state.objects.remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory/bucket".into()
    }
}

/// Mail transport that keeps messages, optionally failing.
#[derive(Clone, Default)]
pub struct CapturingMail {
    pub sent: Arc<Mutex<Vec<MailMessage>>>,
    pub fail: bool,
}

impl MailTransport for CapturingMail {
    fn send(&self, message: &MailMessage) -> Result<()> {
        if self.fail {
            return Err(BackupError::Mail("sendmail exited with 75".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

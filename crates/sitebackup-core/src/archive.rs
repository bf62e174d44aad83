use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::database::DatabaseDumper;
use crate::error::{BackupError, Result};

/// Second-resolution UTC timestamp embedded in archive names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

pub const MANIFEST_MEMBER: &str = "MANIFEST";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveCompression {
    #[default]
    Gzip,
    Zstd,
}

impl ArchiveCompression {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveCompression::Gzip => "gz",
            ArchiveCompression::Zstd => "zst",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveCompression::Gzip => "gzip",
            ArchiveCompression::Zstd => "zstd",
        }
    }
}

impl FromStr for ArchiveCompression {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(ArchiveCompression::Gzip),
            "zstd" | "zst" => Ok(ArchiveCompression::Zstd),
            other => Err(BackupError::Config(format!(
                "unknown compression '{other}' (expected gzip or zstd)"
            ))),
        }
    }
}

/// Deterministic archive identity: `<instance>-<YYYYMMDDHHMMSS>.tar.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub instance: String,
    pub created: DateTime<Utc>,
    pub compression: ArchiveCompression,
}

impl ArchiveName {
    pub fn new(instance: &str, created: DateTime<Utc>, compression: ArchiveCompression) -> Self {
        Self {
            instance: instance.to_string(),
            created: created.trunc_subsecs(0),
            compression,
        }
    }

    /// Name without the `.tar.<ext>` suffix; also the top-level directory
    /// of the filesystem tree inside the archive.
    pub fn stem(&self) -> String {
        format!("{}-{}", self.instance, self.created.format(TIMESTAMP_FORMAT))
    }

    pub fn file_name(&self) -> String {
        format!("{}.tar.{}", self.stem(), self.compression.extension())
    }

    /// Parse a file name produced by [`ArchiveName::file_name`]. The legacy
    /// `<instance>-<timestamp>.tgz` form is accepted too.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, compression) = if let Some(stem) = file_name.strip_suffix(".tar.gz") {
            (stem, ArchiveCompression::Gzip)
        } else if let Some(stem) = file_name.strip_suffix(".tar.zst") {
            (stem, ArchiveCompression::Zstd)
        } else if let Some(stem) = file_name.strip_suffix(".tgz") {
            (stem, ArchiveCompression::Gzip)
        } else {
            return None;
        };

        let (instance, timestamp) = stem.rsplit_once('-')?;
        if instance.is_empty()
            || timestamp.len() != 14
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let created = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();

        Some(Self {
            instance: instance.to_string(),
            created,
            compression,
        })
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// A finished, closed archive in the local scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub name: ArchiveName,
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the archive file.
    pub checksum: Option<String>,
}

impl BackupArchive {
    pub fn file_name(&self) -> String {
        self.name.file_name()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.name.created
    }

    /// Remove the local file. A file that is already gone is fine.
    pub fn remove_local(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What goes into an archive.
pub struct ArchiveSources {
    pub instance_id: String,
    pub description: String,
    pub database: Option<Box<dyn DatabaseDumper>>,
    /// Root of the filesystem tree to embed.
    pub filesystem: Option<PathBuf>,
    /// Paths skipped while walking the tree (e.g. a local target inside it).
    pub excludes: Vec<PathBuf>,
}

impl ArchiveSources {
    /// True when neither a database dump nor a filesystem tree is requested.
    pub fn is_empty(&self) -> bool {
        self.database.is_none() && self.filesystem.is_none()
    }
}

/// Writes one compressed tar archive into a scratch directory.
pub struct ArchiveBuilder {
    scratch_dir: PathBuf,
    compression: ArchiveCompression,
    level: Option<i32>,
}

enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(inner: W, compression: ArchiveCompression, level: Option<i32>) -> Result<Self> {
        Ok(match compression {
            ArchiveCompression::Gzip => {
                let level = level.map(|l| l.clamp(0, 9) as u32).unwrap_or(6);
                Encoder::Gzip(GzEncoder::new(inner, flate2::Compression::new(level)))
            }
            ArchiveCompression::Zstd => {
                Encoder::Zstd(zstd::Encoder::new(inner, level.unwrap_or(3))?)
            }
        })
    }

    fn finish(self) -> std::io::Result<W> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

impl ArchiveBuilder {
    pub fn new(scratch_dir: &Path, compression: ArchiveCompression, level: Option<i32>) -> Self {
        Self {
            scratch_dir: scratch_dir.to_path_buf(),
            compression,
            level,
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Build the archive for `sources` stamped with `now`.
    ///
    /// The archive is written to a temporary file and only appears under its
    /// final name once complete; on any error nothing is left behind.
    pub fn build(&self, sources: &ArchiveSources, now: DateTime<Utc>) -> Result<BackupArchive> {
        let name = ArchiveName::new(&sources.instance_id, now, self.compression);
        let final_path = self.scratch_dir.join(name.file_name());
        if final_path.exists() {
            return Err(BackupError::ArchiveExists(name.file_name()));
        }

        if let Some(root) = &sources.filesystem {
            check_readable_dir(root)?;
        }

        let dump = match &sources.database {
            Some(dumper) => {
                info!("dumping database via {}", dumper.describe());
                Some(dumper.dump()?)
            }
            None => None,
        };

        let tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.scratch_dir)?;

        let stem = name.stem();
        let mut members = Vec::new();
        {
            let writer = BufWriter::new(tmp.as_file());
            let encoder = Encoder::new(writer, self.compression, self.level)?;
            let mut tar = tar::Builder::new(encoder);
            tar.follow_symlinks(false);

            if let Some(dump) = &dump {
                let member = format!("{stem}-db.sql");
                append_bytes(&mut tar, &member, dump, now)?;
                members.push(member);
            }

            if let Some(root) = &sources.filesystem {
                let count = append_tree(&mut tar, root, &stem, &sources.excludes)?;
                debug!("added {count} filesystem entries from {}", root.display());
                members.push(format!("{stem}/"));
            }

            let manifest = manifest_text(sources, &name, &members);
            append_bytes(&mut tar, MANIFEST_MEMBER, manifest.as_bytes(), now)?;

            let encoder = tar.into_inner()?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        tmp.persist_noclobber(&final_path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                BackupError::ArchiveExists(name.file_name())
            } else {
                BackupError::Io(e.error)
            }
        })?;

        let size = std::fs::metadata(&final_path)?.len();
        let checksum = match sha256_file(&final_path) {
            Ok(sum) => Some(sum),
            Err(e) => {
                warn!("could not checksum {}: {e}", final_path.display());
                None
            }
        };

        info!("created archive {} ({size} bytes)", name.file_name());
        Ok(BackupArchive {
            name,
            path: final_path,
            size,
            checksum,
        })
    }
}

fn check_readable_dir(root: &Path) -> Result<()> {
    let meta = std::fs::metadata(root).map_err(|e| {
        BackupError::Filesystem(format!("cannot access '{}': {e}", root.display()))
    })?;
    if !meta.is_dir() {
        return Err(BackupError::Filesystem(format!(
            "'{}' is not a directory",
            root.display()
        )));
    }
    std::fs::read_dir(root).map_err(|e| {
        BackupError::Filesystem(format!("cannot read '{}': {e}", root.display()))
    })?;
    Ok(())
}

fn append_bytes<W: Write>(
    tar: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
    mtime: DateTime<Utc>,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime.timestamp().max(0) as u64);
    header.set_cksum();
    tar.append_data(&mut header, path, data)?;
    Ok(())
}

fn append_tree<W: Write>(
    tar: &mut tar::Builder<W>,
    root: &Path,
    prefix: &str,
    excludes: &[PathBuf],
) -> Result<usize> {
    let excludes: Vec<PathBuf> = excludes
        .iter()
        .filter_map(|p| std::fs::canonicalize(p).ok())
        .collect();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            excludes.is_empty()
                || std::fs::canonicalize(entry.path())
                    .map(|p| !excludes.contains(&p))
                    .unwrap_or(true)
        });

    let mut count = 0;
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string());
            BackupError::Filesystem(format!("cannot read '{path}': {e}"))
        })?;

        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink()) {
            warn!("skipping special file {}", entry.path().display());
            continue;
        }

        let relative = entry.path().strip_prefix(root).map_err(|e| {
            BackupError::Filesystem(format!("{}: {e}", entry.path().display()))
        })?;
        let name = if relative.as_os_str().is_empty() {
            PathBuf::from(prefix)
        } else {
            Path::new(prefix).join(relative)
        };

        tar.append_path_with_name(entry.path(), &name)
            .map_err(|e| {
                BackupError::Filesystem(format!("cannot archive '{}': {e}", entry.path().display()))
            })?;
        count += 1;
    }
    Ok(count)
}

fn manifest_text(sources: &ArchiveSources, name: &ArchiveName, members: &[String]) -> String {
    let mut text = String::new();
    text.push_str(&format!("Instance: {}\n", sources.instance_id));
    text.push_str(&format!("Description: {}\n", sources.description));
    text.push_str(&format!("Timestamp: {}\n", name.created.to_rfc3339()));
    text.push_str(&format!("Host: {}\n", crate::platform::hostname()));
    text.push_str("Members:\n");
    for member in members {
        text.push_str(&format!("  {member}\n"));
    }
    text
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

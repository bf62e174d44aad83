use thiserror::Error;

use sitebackup_storage::StorageError;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("database dump failed: {0}")]
    Dump(String),

    #[error("filesystem snapshot failed: {0}")]
    Filesystem(String),

    #[error("archive already exists: '{0}'")]
    ArchiveExists(String),

    #[error("transfer to '{target}' failed: {message}")]
    Transfer { target: String, message: String },

    #[error("thinning on '{target}' failed: {message}")]
    Thinning { target: String, message: String },

    #[error("instance error: {0}")]
    Instance(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("mail delivery failed: {0}")]
    Mail(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackupError {
    pub fn transfer(target: &str, message: impl ToString) -> Self {
        BackupError::Transfer {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn thinning(target: &str, message: impl ToString) -> Self {
        BackupError::Thinning {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    /// Errors scoped to a single target. Thinning failures count as transfer
    /// failures: the run records them and moves on to the next target.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            BackupError::Transfer { .. } | BackupError::Thinning { .. } | BackupError::Storage(_)
        )
    }

    /// Errors that abort a run before any target is touched.
    pub fn is_fatal(&self) -> bool {
        !self.is_transfer() && !matches!(self, BackupError::Mail(_))
    }
}

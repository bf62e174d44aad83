use crate::archive::ArchiveCompression;

pub(super) fn default_region() -> String {
    "us-east-1".to_string()
}

pub(super) fn default_store_name() -> String {
    "s3".to_string()
}

pub(super) fn default_dump_timeout_secs() -> u64 {
    3600
}

pub(super) fn default_sendmail() -> String {
    "/usr/sbin/sendmail".to_string()
}

pub(super) fn default_compression() -> ArchiveCompression {
    ArchiveCompression::Gzip
}

pub(super) fn default_thinning() -> String {
    "none".to_string()
}

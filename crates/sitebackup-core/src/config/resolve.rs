use std::fmt;
use std::path::{Path, PathBuf};

use super::types::FileConfig;
use crate::error::{BackupError, Result};

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SITEBACKUP_CONFIG";

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
/// Comment lines are copied verbatim.
pub(super) fn expand_env_placeholders(input: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut line_start = 0usize;

    for line in input.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            out.push_str(line);
        } else {
            expand_line(line, line_start, input, path, &mut out)?;
        }
        line_start += line.len();
    }
    Ok(out)
}

fn expand_line(line: &str, base: usize, input: &str, path: &Path, out: &mut String) -> Result<()> {
    let mut cursor = 0usize;
    while let Some(offset) = line[cursor..].find("${") {
        let start = cursor + offset;
        out.push_str(&line[cursor..start]);

        let token_start = start + 2;
        let Some(token_end_rel) = line[token_start..].find('}') else {
            return Err(config_expand_error(
                path,
                input,
                base + start,
                "unterminated environment placeholder",
            ));
        };
        let token_end = token_start + token_end_rel;
        let token = &line[token_start..token_end];
        out.push_str(&resolve_env_token(token, path, input, base + start)?);
        cursor = token_end + 1;
    }
    out.push_str(&line[cursor..]);
    Ok(())
}

fn resolve_env_token(token: &str, path: &Path, input: &str, start: usize) -> Result<String> {
    let (name, default) = match token.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (token, None),
    };
    if !is_valid_env_var_name(name) {
        return Err(config_expand_error(
            path,
            input,
            start,
            format!("invalid environment placeholder '{token}'"),
        ));
    }

    match (std::env::var(name), default) {
        (Ok(value), Some(default)) if value.is_empty() => Ok(default.to_string()),
        (Ok(value), _) => Ok(value),
        (Err(std::env::VarError::NotPresent), Some(default)) => Ok(default.to_string()),
        (Err(std::env::VarError::NotPresent), None) => Err(config_expand_error(
            path,
            input,
            start,
            format!("environment variable '{name}' is not set"),
        )),
        (Err(std::env::VarError::NotUnicode(_)), _) => Err(config_expand_error(
            path,
            input,
            start,
            format!("environment variable '{name}' is not valid UTF-8"),
        )),
    }
}

fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn config_expand_error(
    path: &Path,
    input: &str,
    start: usize,
    message: impl fmt::Display,
) -> BackupError {
    let (line, column) = byte_offset_to_line_col(input, start);
    BackupError::Config(format!(
        "invalid config '{}': {message} at line {line}, column {column}",
        path.display()
    ))
}

fn byte_offset_to_line_col(input: &str, byte_offset: usize) -> (usize, usize) {
    let mut line = 1usize;
    let mut column = 1usize;
    for ch in input[..byte_offset].chars() {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `SITEBACKUP_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV_VAR})", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("sitebackup.yaml"), "project")];

    let user_config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|base| base.join("sitebackup").join("config.yaml"));

    if let Some(p) = user_config {
        paths.push((p, "user"));
    }

    paths.push((PathBuf::from("/etc/sitebackup/config.yaml"), "system"));
    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `SITEBACKUP_CONFIG` > first existing file from the
/// search paths. Returns `None` if nothing is found.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

/// Read, expand and parse a config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BackupError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    parse_config(&raw, path)
}

pub(super) fn parse_config(raw: &str, path: &Path) -> Result<FileConfig> {
    let expanded = expand_env_placeholders(raw, path)?;
    if expanded.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&expanded)
        .map_err(|e| BackupError::Config(format!("invalid config '{}': {e}", path.display())))
}

/// Returns a commented YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# sitebackup configuration file
# Every value can also be given (or overridden) on the command line.

# Identifier used in archive names; defaults to the site title or directory name.
# label: acme

# database:
#   name: wordpress
#   host: localhost
#   port: 3306
#   user: backup
#   password: ${SITEBACKUP_DB_PASSWORD}
#   prefix: wp_
#   # dump_command: "pg_dump mydb"

# compression: gzip        # gzip | zstd

# Local directory that keeps a copy of every archive (never thinned).
attic: /var/backups/sites

thinning: "7D4W12M"

# object_stores:
#   - name: offsite
#     endpoint: s3.example.com
#     bucket: acme-backups
#     region: us-east-1
#     access_key_id: ${S3_ACCESS_KEY}
#     secret_access_key: ${S3_SECRET_KEY}

# mail:
#   from: backup@example.com
#   to:
#     - ops@example.com
#   to_admin: false
"#
}

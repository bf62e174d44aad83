use std::process::{Command, Output};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{DatabaseSettings, DumpSource};
use crate::error::{BackupError, Result};
use crate::platform::shell;
use crate::source::DatabaseCredentials;

/// Produces the SQL dump that goes into the archive.
pub trait DatabaseDumper {
    /// Short description for logs and the manifest.
    fn describe(&self) -> String;

    /// Run the dump. Empty output is an error.
    fn dump(&self) -> Result<Vec<u8>>;
}

/// Build the dumper matching the resolved settings.
pub fn dumper_from_settings(settings: &DatabaseSettings) -> Box<dyn DatabaseDumper> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    match &settings.source {
        DumpSource::Mysql(creds) => Box::new(MysqlDump::new(creds.clone(), timeout)),
        DumpSource::Command(command) => Box::new(CommandDump::new(command.clone(), timeout)),
    }
}

/// `mysql`/`mysqldump` invocation with connection arguments. The password
/// travels in `MYSQL_PWD` so it never shows up in the process list.
pub(crate) fn client_command(program: &str, creds: &DatabaseCredentials) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg(format!("--host={}", creds.host))
        .arg(format!("--user={}", creds.user));
    if let Some(port) = creds.port {
        cmd.arg(format!("--port={port}"));
    }
    if let Some(charset) = &creds.charset {
        cmd.arg(format!("--default-character-set={charset}"));
    }
    if !creds.password.is_empty() {
        cmd.env("MYSQL_PWD", &creds.password);
    }
    cmd
}

fn exit_code(output: &Output) -> String {
    output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Dumps the instance's tables with `mysqldump --opt`.
pub struct MysqlDump {
    creds: DatabaseCredentials,
    timeout: Duration,
}

impl MysqlDump {
    pub fn new(creds: DatabaseCredentials, timeout: Duration) -> Self {
        Self { creds, timeout }
    }

    /// Tables whose name starts with the configured prefix.
    fn list_tables(&self) -> Result<Vec<String>> {
        let pattern = like_prefix_pattern(&self.creds.prefix);
        let mut cmd = client_command("mysql", &self.creds);
        cmd.arg("--batch")
            .arg("--skip-column-names")
            .arg("-e")
            .arg(format!("SHOW TABLES LIKE '{pattern}'"))
            .arg(&self.creds.name);

        let output = shell::run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|e| BackupError::Dump(format!("failed to run mysql: {e}")))?;
        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "listing tables of '{}' failed (exit code {}): {}",
                self.creds.name,
                exit_code(&output),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_table_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `LIKE` pattern matching names that start with `prefix`, written as the
/// body of a single-quoted MySQL string literal.
pub(crate) fn like_prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        match c {
            // One literal backslash in the LIKE pattern, escaped again for the
            // string literal.
            '\\' => pattern.push_str("\\\\\\\\"),
            '\'' => pattern.push_str("\\'"),
            '_' | '%' => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('%');
    pattern
}

pub(crate) fn parse_table_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl DatabaseDumper for MysqlDump {
    fn describe(&self) -> String {
        format!("mysql://{}@{}/{}", self.creds.user, self.creds.host, self.creds.name)
    }

    fn dump(&self) -> Result<Vec<u8>> {
        let tables = self.list_tables()?;
        if tables.is_empty() {
            return Err(BackupError::Dump(format!(
                "no tables with prefix '{}' in database '{}'",
                self.creds.prefix, self.creds.name
            )));
        }
        debug!("dumping {} tables from '{}'", tables.len(), self.creds.name);

        let mut cmd = client_command("mysqldump", &self.creds);
        cmd.arg("--opt").arg(&self.creds.name).args(&tables);

        let output = shell::run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|e| BackupError::Dump(format!("failed to run mysqldump: {e}")))?;
        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "mysqldump of '{}' failed (exit code {}): {}",
                self.creds.name,
                exit_code(&output),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(BackupError::Dump(format!(
                "mysqldump of '{}' produced no output",
                self.creds.name
            )));
        }

        info!(
            "dumped database '{}' ({} tables, {} bytes)",
            self.creds.name,
            tables.len(),
            output.stdout.len()
        );
        Ok(output.stdout)
    }
}

/// Runs an operator-supplied shell command and captures its stdout.
pub struct CommandDump {
    command: String,
    timeout: Duration,
}

impl CommandDump {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl DatabaseDumper for CommandDump {
    fn describe(&self) -> String {
        format!("command '{}'", self.command)
    }

    fn dump(&self) -> Result<Vec<u8>> {
        let output = shell::run_script_with_timeout(&self.command, self.timeout).map_err(|e| {
            BackupError::Dump(format!("failed to execute '{}': {e}", self.command))
        })?;

        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "'{}' failed (exit code {}): {}",
                self.command,
                exit_code(&output),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(BackupError::Dump(format!(
                "'{}' produced empty output",
                self.command
            )));
        }

        info!("dump command produced {} bytes", output.stdout.len());
        Ok(output.stdout)
    }
}

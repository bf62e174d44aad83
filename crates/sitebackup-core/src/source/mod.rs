pub mod humhub;
pub mod vaultwarden;
pub mod wordpress;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{DatabaseOverrides, label_from_path, slugify};
use crate::database::client_command;
use crate::error::{BackupError, Result};
use crate::platform::shell;

const SITE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection details for a MySQL/MariaDB database.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    /// Only tables starting with this prefix belong to the instance.
    pub prefix: String,
    pub charset: Option<String>,
}

impl DatabaseCredentials {
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.user.is_empty()
    }

    /// Apply command-line or config-file values on top of detected ones.
    pub fn apply(&mut self, overrides: &DatabaseOverrides) {
        if let Some(name) = &overrides.name {
            self.name = name.clone();
        }
        if let Some(host) = &overrides.host {
            let (host, port) = split_host_port(host);
            self.host = host;
            if port.is_some() {
                self.port = port;
            }
        }
        if overrides.port.is_some() {
            self.port = overrides.port;
        }
        if let Some(user) = &overrides.user {
            self.user = user.clone();
        }
        if let Some(password) = &overrides.password {
            self.password = password.clone();
        }
        if let Some(prefix) = &overrides.prefix {
            self.prefix = prefix.clone();
        }
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("charset", &self.charset)
            .finish()
    }
}

/// Split `host:port`; a port that does not parse stays part of the host.
pub fn split_host_port(value: &str) -> (String, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (value.to_string(), None),
        },
        _ => (value.to_string(), None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    WordPress,
    HumHub,
    Vaultwarden,
    Generic,
}

/// Title and administrator address of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub title: String,
    pub admin_email: Option<String>,
}

/// What a [`Detector`] read from an instance's configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub kind: InstanceKind,
    pub credentials: DatabaseCredentials,
    /// Site details found in the file itself, if any.
    pub site: Option<SiteInfo>,
}

/// Recognises one kind of web application by its configuration file.
pub trait Detector: Sync {
    fn name(&self) -> &'static str;

    /// Path of the configuration file, relative to the instance root.
    fn config_file(&self) -> &'static str;

    /// Interpret the configuration file. An error means the file exists
    /// but does not describe a usable instance.
    fn inspect(&self, text: &str) -> std::result::Result<Detected, String>;

    /// Ask the instance's database for its title and admin address.
    fn site_info(&self, _credentials: &DatabaseCredentials) -> Option<SiteInfo> {
        None
    }
}

/// Tried in order; the first one that recognises the instance wins.
const DETECTORS: &[&dyn Detector] = &[
    &wordpress::WordPress,
    &humhub::HumHub,
    &vaultwarden::Vaultwarden,
];

/// The site being backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub kind: InstanceKind,
    pub path: PathBuf,
    /// Identifier used in archive names and as the default bucket.
    pub slug: String,
    pub title: String,
    pub admin_email: Option<String>,
    pub database: Option<DatabaseCredentials>,
}

impl Instance {
    pub fn description(&self) -> String {
        match self.kind {
            InstanceKind::WordPress => format!("WordPress site '{}'", self.title),
            InstanceKind::HumHub => format!("HumHub '{}'", self.title),
            InstanceKind::Vaultwarden => format!("Vaultwarden '{}'", self.title),
            InstanceKind::Generic => format!("site '{}'", self.title),
        }
    }
}

/// Run the detectors against `path`. A directory none of them recognises
/// is a generic instance; if every configuration file found was unusable
/// the error lists what each detector saw.
fn recognise(path: &Path) -> Result<(Option<&'static dyn Detector>, Detected)> {
    let mut notes = Vec::new();
    let mut failed = false;

    for detector in DETECTORS.iter().copied() {
        let file = path.join(detector.config_file());
        if !file.is_file() {
            notes.push(format!("{}: no {}", detector.name(), detector.config_file()));
            continue;
        }
        let text = std::fs::read_to_string(&file).map_err(|e| {
            BackupError::Instance(format!("cannot read '{}': {e}", file.display()))
        })?;
        match detector.inspect(&text) {
            Ok(detected) => {
                if failed {
                    warn!("using {} after: {}", detector.name(), notes.join("; "));
                }
                return Ok((Some(detector), detected));
            }
            Err(e) => {
                failed = true;
                notes.push(format!("{}: {}: {e}", detector.name(), detector.config_file()));
            }
        }
    }

    if failed {
        return Err(BackupError::Instance(format!(
            "cannot detect the instance at '{}': {}",
            path.display(),
            notes.join("; ")
        )));
    }
    debug!("no known application at {}: {}", path.display(), notes.join("; "));
    Ok((
        None,
        Detected {
            kind: InstanceKind::Generic,
            credentials: DatabaseCredentials::default(),
            site: None,
        },
    ))
}

/// Inspect `path` and build the [`Instance`] it holds.
///
/// Database settings come from the application's configuration file;
/// `overrides` win over detected values. `label` forces the archive
/// identifier.
pub fn detect(path: &Path, overrides: &DatabaseOverrides, label: Option<&str>) -> Result<Instance> {
    if !path.is_dir() {
        return Err(BackupError::Instance(format!(
            "'{}' does not exist or is not a directory",
            path.display()
        )));
    }

    let (detector, detected) = recognise(path)?;
    let kind = detected.kind;
    let mut credentials = detected.credentials;
    credentials.apply(overrides);
    if credentials.host.is_empty() {
        credentials.host = "localhost".to_string();
    }

    let database = credentials.is_complete().then_some(credentials);
    let dir_name = label_from_path(path);

    let site = match (detector, &database) {
        (Some(detector), Some(creds)) => detector.site_info(creds),
        _ => None,
    }
    .or(detected.site);
    let (title, admin_email) = match site {
        Some(info) => (info.title, info.admin_email),
        None => (dir_name.clone(), None),
    };

    let slug = match label {
        Some(label) => slugify(label),
        None => {
            let from_title = slugify(&title);
            if from_title.is_empty() {
                slugify(&dir_name)
            } else {
                from_title
            }
        }
    };
    if slug.is_empty() {
        return Err(BackupError::Instance(format!(
            "cannot derive an identifier for '{}'; pass --label",
            path.display()
        )));
    }

    debug!(?kind, slug = %slug, "detected instance at {}", path.display());

    Ok(Instance {
        kind,
        path: path.to_path_buf(),
        slug,
        title,
        admin_email,
        database,
    })
}

/// `creds.prefix` reduced to characters valid in an unquoted table name.
fn table_prefix(creds: &DatabaseCredentials) -> String {
    creds
        .prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Run `query` with the `mysql` client and return its tab-separated rows.
/// Any failure is logged and yields `None`.
fn query_rows(creds: &DatabaseCredentials, query: &str) -> Option<String> {
    let mut cmd = client_command("mysql", creds);
    cmd.arg("--batch")
        .arg("--skip-column-names")
        .arg("--connect-timeout=5")
        .arg("-e")
        .arg(query)
        .arg(&creds.name);

    match shell::run_command_with_timeout(&mut cmd, SITE_QUERY_TIMEOUT) {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            warn!(
                "could not query site info: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            None
        }
        Err(e) => {
            warn!("could not query site info: {e}");
            None
        }
    }
}

/// Pick the title and admin address out of `name<TAB>value` rows.
fn parse_name_values(output: &str, title_key: &str, email_key: &str) -> Option<SiteInfo> {
    let mut title = None;
    let mut admin_email = None;
    for line in output.lines() {
        let Some((name, value)) = line.split_once('\t') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if name == title_key {
            title = Some(value.to_string());
        } else if name == email_key {
            admin_email = Some(value.to_string());
        }
    }
    title.map(|title| SiteInfo { title, admin_email })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_split() {
        assert_eq!(split_host_port("db:3307"), ("db".to_string(), Some(3307)));
        assert_eq!(split_host_port("localhost"), ("localhost".to_string(), None));
        assert_eq!(
            split_host_port("localhost:/run/mysqld.sock"),
            ("localhost:/run/mysqld.sock".to_string(), None)
        );
    }

    #[test]
    fn debug_hides_password() {
        let creds = DatabaseCredentials {
            password: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn generic_instance_uses_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        let site = tmp.path().join("Acme Shop");
        std::fs::create_dir(&site).unwrap();

        let instance = detect(&site, &DatabaseOverrides::default(), None).unwrap();
        assert_eq!(instance.kind, InstanceKind::Generic);
        assert_eq!(instance.slug, "acme-shop");
        assert_eq!(instance.title, "Acme Shop");
        assert!(instance.database.is_none());
    }

    #[test]
    fn label_overrides_slug() {
        let tmp = tempfile::tempdir().unwrap();
        let instance =
            detect(tmp.path(), &DatabaseOverrides::default(), Some("Acme Blog")).unwrap();
        assert_eq!(instance.slug, "acme-blog");
    }

    #[test]
    fn overrides_provide_credentials_for_generic_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let overrides = DatabaseOverrides {
            name: Some("shop".into()),
            host: Some("db.internal:3307".into()),
            user: Some("backup".into()),
            ..Default::default()
        };
        let instance = detect(tmp.path(), &overrides, Some("shop")).unwrap();
        let db = instance.database.unwrap();
        assert_eq!(db.host, "db.internal");
        assert_eq!(db.port, Some(3307));
        assert_eq!(db.user, "backup");
    }

    #[test]
    fn missing_path_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = detect(
            &tmp.path().join("nope"),
            &DatabaseOverrides::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Instance(_)));
    }

    fn write(root: &Path, relative: &str, text: &str) {
        let file = root.join(relative);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, text).unwrap();
    }

    const DYNAMIC_PHP: &str = r#"<?php return array (
  'components' => array (
    'db' => array (
      'dsn' => 'mysql:host=localhost;dbname=humhub',
    ),
  ),
  'name' => 'Acme Community',
);
"#;

    #[test]
    fn wordpress_config_wins() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "wp-config.php", "define('DB_NAME', 'acme_wp');");
        write(tmp.path(), "config.json", r#"{"domain": "vault.acme.test", "smtp_from": "a@b"}"#);

        let instance = detect(tmp.path(), &DatabaseOverrides::default(), Some("acme")).unwrap();
        assert_eq!(instance.kind, InstanceKind::WordPress);
        // No DB_USER, so the database is not queried.
        assert!(instance.database.is_none());
    }

    #[test]
    fn humhub_title_comes_from_its_config() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), humhub::CONFIG_FILE, DYNAMIC_PHP);

        let instance = detect(tmp.path(), &DatabaseOverrides::default(), None).unwrap();
        assert_eq!(instance.kind, InstanceKind::HumHub);
        assert_eq!(instance.title, "Acme Community");
        assert_eq!(instance.slug, "acme-community");
        assert_eq!(instance.description(), "HumHub 'Acme Community'");
        assert!(instance.database.is_none());
    }

    #[test]
    fn vaultwarden_is_detected_from_config_json() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            vaultwarden::CONFIG_FILE,
            r#"{"domain": "Acme Vault", "smtp_from": "vault@acme.test", "signups_allowed": false}"#,
        );

        let instance = detect(tmp.path(), &DatabaseOverrides::default(), None).unwrap();
        assert_eq!(instance.kind, InstanceKind::Vaultwarden);
        assert_eq!(instance.title, "Acme Vault");
        assert_eq!(instance.admin_email.as_deref(), Some("vault@acme.test"));
        assert_eq!(instance.slug, "acme-vault");
        assert!(instance.database.is_none());
    }

    #[test]
    fn unusable_configs_report_every_detector() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), humhub::CONFIG_FILE, "<?php return array ('name' => 'x');");
        write(tmp.path(), vaultwarden::CONFIG_FILE, "{ not json");

        let err = detect(tmp.path(), &DatabaseOverrides::default(), None).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, BackupError::Instance(_)));
        assert!(msg.contains("WordPress: no wp-config.php"), "{msg}");
        assert!(
            msg.contains("HumHub: protected/config/dynamic.php: no database given"),
            "{msg}"
        );
        assert!(msg.contains("Vaultwarden: config.json: invalid JSON"), "{msg}");
    }

    #[test]
    fn later_detector_can_recognise_after_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), humhub::CONFIG_FILE, "<?php echo 'hello';");
        write(
            tmp.path(),
            vaultwarden::CONFIG_FILE,
            r#"{"domain": "vault.acme.test", "smtp_from": "vault@acme.test"}"#,
        );

        let instance = detect(tmp.path(), &DatabaseOverrides::default(), None).unwrap();
        assert_eq!(instance.kind, InstanceKind::Vaultwarden);
    }

    #[test]
    fn name_value_rows() {
        let info = parse_name_values(
            "blogname\tAcme Blog\nadmin_email\tops@acme.test\nsiteurl\thttps://acme.test\n",
            "blogname",
            "admin_email",
        )
        .unwrap();
        assert_eq!(info.title, "Acme Blog");
        assert_eq!(info.admin_email.as_deref(), Some("ops@acme.test"));

        assert!(
            parse_name_values("admin_email\tops@acme.test\n", "blogname", "admin_email").is_none()
        );
        assert!(parse_name_values("blogname\t\n", "blogname", "admin_email").is_none());
    }
}

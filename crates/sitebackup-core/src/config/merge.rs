use std::path::PathBuf;

use sitebackup_storage::{RetryConfig, StorageConfig};

use super::defaults::{default_region, default_sendmail};
use super::types::*;
use super::util::expand_tilde;
use crate::error::{BackupError, Result};
use crate::source;
use crate::thinning::ThinningStrategy;

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Database values from the file, overridden by the command line.
fn merge_database(file: &DatabaseSection, cli: &DatabaseOverrides) -> DatabaseOverrides {
    DatabaseOverrides {
        name: cli.name.clone().or_else(|| file.name.clone()),
        host: cli.host.clone().or_else(|| file.host.clone()),
        port: cli.port.or(file.port),
        user: cli.user.clone().or_else(|| file.user.clone()),
        password: cli.password.clone().or_else(|| file.password.clone()),
        prefix: cli.prefix.clone().or_else(|| file.prefix.clone()),
        command: non_empty(cli.command.as_ref()).or_else(|| non_empty(file.dump_command.as_ref())),
    }
}

fn object_store_settings(
    entry: &ObjectStoreEntry,
    default_bucket: &str,
) -> Result<ObjectStoreSettings> {
    let access_key_id = non_empty(entry.access_key_id.as_ref()).ok_or_else(|| {
        BackupError::Config(format!("object store '{}' has no access key", entry.name))
    })?;
    let secret_access_key = non_empty(entry.secret_access_key.as_ref()).ok_or_else(|| {
        BackupError::Config(format!("object store '{}' has no secret key", entry.name))
    })?;
    Ok(ObjectStoreSettings {
        name: entry.name.clone(),
        storage: StorageConfig {
            endpoint: entry.endpoint.clone(),
            bucket: non_empty(entry.bucket.as_ref()).unwrap_or_else(|| default_bucket.to_string()),
            region: entry.region.clone(),
            access_key_id,
            secret_access_key,
            root: entry.root.clone(),
            allow_insecure_http: entry.allow_insecure_http,
            retry: entry.retry.clone(),
        },
    })
}

impl BackupConfig {
    /// Merge the config file with command-line overrides, detect the
    /// instance and validate the result.
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let thinning_text = non_empty(overrides.thinning.as_ref())
            .unwrap_or_else(|| file.thinning_or_default());
        let thinning: ThinningStrategy = thinning_text.parse()?;

        // Without database and filesystem the run only thins existing archives.
        if !overrides.include_database
            && !overrides.include_filesystem
            && thinning == ThinningStrategy::None
        {
            return Err(BackupError::Config(
                "nothing to back up: pass --database and/or --filesystem \
                 (or --thinning to only thin existing archives)"
                    .into(),
            ));
        }

        let path = expand_tilde(&overrides.path.to_string_lossy());
        let db_overrides = merge_database(&file.database, &overrides.database);
        let label = non_empty(overrides.label.as_ref()).or_else(|| non_empty(file.label.as_ref()));
        let instance = source::detect(&path, &db_overrides, label.as_deref())?;

        let database = if overrides.include_database {
            let source = match (&db_overrides.command, &instance.database) {
                (Some(command), _) => DumpSource::Command(command.clone()),
                (None, Some(creds)) => DumpSource::Mysql(creds.clone()),
                (None, None) => {
                    return Err(BackupError::Config(format!(
                        "database backup requested but no credentials found for '{}' \
                         (use --db/--dbuser or a dump command)",
                        instance.path.display()
                    )));
                }
            };
            Some(DatabaseSettings {
                source,
                timeout_secs: file.database.timeout_secs,
            })
        } else {
            None
        };


        let attic = non_empty(overrides.attic.as_ref())
            .or_else(|| non_empty(file.attic.as_ref()))
            .map(|p| expand_tilde(&p));

        let mut stores = file.object_stores.clone();
        if let Some(s3) = &overrides.s3 {
            stores.retain(|e| e.name != "s3");
            stores.push(ObjectStoreEntry {
                name: "s3".into(),
                endpoint: s3.host.clone(),
                bucket: s3.bucket.clone(),
                region: s3.region.clone().unwrap_or_else(default_region),
                access_key_id: s3.access_key.clone(),
                secret_access_key: s3.secret_key.clone(),
                root: String::new(),
                allow_insecure_http: false,
                retry: RetryConfig::default(),
            });
        }
        let mut object_stores = Vec::with_capacity(stores.len());
        for entry in &stores {
            if object_stores
                .iter()
                .any(|s: &ObjectStoreSettings| s.name == entry.name)
                || (attic.is_some() && entry.name == "local")
            {
                return Err(BackupError::Config(format!(
                    "duplicate target name '{}'",
                    entry.name
                )));
            }
            object_stores.push(object_store_settings(entry, &instance.slug)?);
        }

        let mail = resolve_mail(file.mail.as_ref(), &overrides, instance.admin_email.as_deref());

        let scratch_dir = non_empty(overrides.scratch_dir.as_ref())
            .or_else(|| non_empty(file.scratch_dir.as_ref()))
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(std::env::temp_dir);

        Ok(BackupConfig {
            include_database: overrides.include_database,
            include_filesystem: overrides.include_filesystem,
            database,
            scratch_dir,
            compression: overrides
                .compression
                .unwrap_or_else(|| file.compression_or_default()),
            compression_level: file.compression_level,
            attic,
            object_stores,
            thinning,
            dry_run: overrides.dry_run,
            mail,
            instance,
        })
    }

    /// Names of all configured targets, in processing order.
    pub fn target_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.attic.is_some() {
            names.push("local".to_string());
        }
        names.extend(self.object_stores.iter().map(|s| s.name.clone()));
        names
    }
}

fn resolve_mail(
    file: Option<&MailSection>,
    overrides: &Overrides,
    admin_email: Option<&str>,
) -> Option<MailSettings> {
    let mut to: Vec<String> = if overrides.mail_to.is_empty() {
        file.map(|m| m.to.clone()).unwrap_or_default()
    } else {
        overrides.mail_to.clone()
    };

    if overrides.mail_to_admin || file.is_some_and(|m| m.to_admin) {
        match admin_email {
            Some(admin) if !to.iter().any(|t| t == admin) => to.push(admin.to_string()),
            Some(_) => {}
            None => tracing::warn!("--mail-to-admin given but the instance has no admin address"),
        }
    }
    if to.is_empty() {
        return None;
    }

    let from = non_empty(overrides.mail_from.as_ref())
        .or_else(|| file.and_then(|m| non_empty(m.from.as_ref())))
        .unwrap_or_else(|| format!("sitebackup@{}", crate::platform::hostname()));
    let sendmail = file
        .map(|m| m.sendmail.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(default_sendmail);

    Some(MailSettings {
        from,
        to,
        sendmail: PathBuf::from(sendmail),
    })
}

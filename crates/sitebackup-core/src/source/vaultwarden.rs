//! Vaultwarden instances, recognised by the admin panel's `config.json`.

use serde::Deserialize;

use super::{DatabaseCredentials, Detected, Detector, InstanceKind, SiteInfo};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize)]
struct AdminConfig {
    domain: Option<String>,
    smtp_from: Option<String>,
}

/// Title and admin address from the text of `config.json`.
pub fn parse_config(text: &str) -> Result<SiteInfo, String> {
    let config: AdminConfig =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    let title = config
        .domain
        .filter(|d| !d.is_empty())
        .ok_or("missing key 'domain'")?;
    let admin_email = config.smtp_from.ok_or("missing key 'smtp_from'")?;
    Ok(SiteInfo {
        title,
        admin_email: Some(admin_email),
    })
}

pub struct Vaultwarden;

impl Detector for Vaultwarden {
    fn name(&self) -> &'static str {
        "Vaultwarden"
    }

    fn config_file(&self) -> &'static str {
        CONFIG_FILE
    }

    // The SQLite database lives in the data directory and travels with the
    // filesystem archive.
    fn inspect(&self, text: &str) -> Result<Detected, String> {
        Ok(Detected {
            kind: InstanceKind::Vaultwarden,
            credentials: DatabaseCredentials::default(),
            site: Some(parse_config(text)?),
        })
    }
}

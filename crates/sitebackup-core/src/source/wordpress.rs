use std::sync::LazyLock;

use regex::Regex;

use super::{DatabaseCredentials, Detected, Detector, InstanceKind, SiteInfo};

pub const CONFIG_FILE: &str = "wp-config.php";

static DEFINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"define\s*\(\s*['"](DB_NAME|DB_USER|DB_PASSWORD|DB_HOST|DB_CHARSET)['"]\s*,\s*(?:'([^']*)'|"([^"]*)")\s*\)"#,
    )
    .unwrap_or_else(|e| panic!("invalid define pattern: {e}"))
});

static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\$table_prefix\s*=\s*(?:'([^']*)'|"([^"]*)")"#)
        .unwrap_or_else(|e| panic!("invalid prefix pattern: {e}"))
});

/// Extract database settings from the text of a `wp-config.php`.
pub fn parse_config(text: &str) -> DatabaseCredentials {
    let mut creds = DatabaseCredentials {
        prefix: "wp_".to_string(),
        ..Default::default()
    };

    for caps in DEFINE_RE.captures_iter(text) {
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        match &caps[1] {
            "DB_NAME" => creds.name = value,
            "DB_USER" => creds.user = value,
            "DB_PASSWORD" => creds.password = value,
            "DB_HOST" => {
                let (host, port) = super::split_host_port(&value);
                creds.host = host;
                creds.port = port;
            }
            "DB_CHARSET" if !value.is_empty() => creds.charset = Some(value),
            _ => {}
        }
    }

    if let Some(caps) = PREFIX_RE.captures(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            creds.prefix = m.as_str().to_string();
        }
    }

    creds
}

/// Parse `option_name<TAB>option_value` rows returned by the options query.
pub fn parse_site_options(output: &str) -> Option<SiteInfo> {
    super::parse_name_values(output, "blogname", "admin_email")
}

pub struct WordPress;

impl Detector for WordPress {
    fn name(&self) -> &'static str {
        "WordPress"
    }

    fn config_file(&self) -> &'static str {
        CONFIG_FILE
    }

    fn inspect(&self, text: &str) -> Result<Detected, String> {
        Ok(Detected {
            kind: InstanceKind::WordPress,
            credentials: parse_config(text),
            site: None,
        })
    }

    /// Blog title and admin address from the `options` table.
    fn site_info(&self, credentials: &DatabaseCredentials) -> Option<SiteInfo> {
        let prefix = super::table_prefix(credentials);
        let query = format!(
            "SELECT option_name, option_value FROM {prefix}options \
             WHERE option_name IN ('blogname', 'admin_email')"
        );
        let info = parse_site_options(&super::query_rows(credentials, &query)?);
        if info.is_none() {
            tracing::warn!("site title not found in {prefix}options");
        }
        info
    }
}

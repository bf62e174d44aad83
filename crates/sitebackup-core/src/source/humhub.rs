//! HumHub instances, recognised by `protected/config/dynamic.php`.
//!
//! That file is written by HumHub itself with `var_export`, so it is a
//! single `return array (...);` of literals. [`parse_php_return`] reads
//! exactly that subset of PHP.

use super::{DatabaseCredentials, Detected, Detector, InstanceKind, SiteInfo, split_host_port};

pub const CONFIG_FILE: &str = "protected/config/dynamic.php";

/// A PHP literal as found in `dynamic.php`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhpValue {
    /// A quoted string.
    Str(String),
    /// An unquoted literal: number, `true`, `null`, a constant name.
    Bare(String),
    /// Entries in source order; list entries have no key.
    Array(Vec<(Option<String>, PhpValue)>),
}

impl PhpValue {
    /// Value stored under `key` in an array.
    pub fn get(&self, key: &str) -> Option<&PhpValue> {
        match self {
            PhpValue::Array(entries) => entries
                .iter()
                .find(|(k, _)| k.as_deref() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Text of a string or bare literal.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PhpValue::Str(s) | PhpValue::Bare(s) => Some(s),
            PhpValue::Array(_) => None,
        }
    }

    fn path(&self, keys: &[&str]) -> Option<&PhpValue> {
        keys.iter().try_fold(self, |value, key| value.get(key))
    }
}

/// Parse a PHP file of the form `<?php return <literal>;`.
pub fn parse_php_return(text: &str) -> Result<PhpValue, String> {
    let mut parser = Parser { src: text, pos: 0 };
    parser.skip_space();
    parser.eat("<?php");
    parser.skip_space();
    if !parser.eat_keyword("return") {
        return Err("configuration does not start with 'return'".into());
    }
    let value = parser.value()?;
    parser.skip_space();
    parser.eat(";");
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = self.rest();
        if !rest
            .get(..keyword.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        {
            return false;
        }
        if rest[keyword.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            return false;
        }
        self.pos += keyword.len();
        true
    }

    fn skip_space(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with("//") || trimmed.starts_with('#') {
                self.pos += trimmed.find('\n').unwrap_or(trimmed.len());
            } else if trimmed.starts_with("/*") {
                match trimmed.find("*/") {
                    Some(end) => self.pos += end + 2,
                    None => self.pos = self.src.len(),
                }
            } else {
                return;
            }
        }
    }

    fn error(&self, what: &str) -> String {
        let line = self.src[..self.pos].matches('\n').count() + 1;
        format!("{what} on line {line}")
    }

    fn value(&mut self) -> Result<PhpValue, String> {
        self.skip_space();
        match self.peek() {
            Some('\'') => self.single_quoted().map(PhpValue::Str),
            Some('"') => self.double_quoted().map(PhpValue::Str),
            Some('[') => {
                self.bump();
                self.entries(']')
            }
            Some(_) if self.eat_keyword("array") => {
                self.skip_space();
                if !self.eat("(") {
                    return Err(self.error("expected '(' after 'array'"));
                }
                self.entries(')')
            }
            Some(_) => self.bare(),
            None => Err(self.error("unexpected end of file")),
        }
    }

    fn entries(&mut self, close: char) -> Result<PhpValue, String> {
        let mut entries = Vec::new();
        loop {
            self.skip_space();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(PhpValue::Array(entries));
            }
            let first = self.value()?;
            self.skip_space();
            let entry = if self.eat("=>") {
                let key = first
                    .as_str()
                    .ok_or_else(|| self.error("array used as a key"))?
                    .to_string();
                (Some(key), self.value()?)
            } else {
                (None, first)
            };
            entries.push(entry);

            self.skip_space();
            if self.eat(",") {
                continue;
            }
            if self.peek() != Some(close) {
                return Err(self.error(&format!("expected ',' or '{close}'")));
            }
        }
    }

    fn single_quoted(&mut self) -> Result<String, String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\'') => return Ok(out),
                Some('\\') => match self.peek() {
                    Some(c @ ('\'' | '\\')) => {
                        self.bump();
                        out.push(c);
                    }
                    _ => out.push('\\'),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn double_quoted(&mut self) -> Result<String, String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => {
                    let escaped = match self.peek() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(c @ ('\\' | '"' | '$')) => c,
                        _ => {
                            out.push('\\');
                            continue;
                        }
                    };
                    self.bump();
                    out.push(escaped);
                }
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn bare(&mut self) -> Result<PhpValue, String> {
        let len = self
            .rest()
            .find(|c: char| !(c.is_alphanumeric() || "_.-+\\:".contains(c)))
            .unwrap_or(self.rest().len());
        if len == 0 {
            return Err(self.error("unexpected character"));
        }
        let token = self.rest()[..len].to_string();
        self.pos += len;
        Ok(PhpValue::Bare(token))
    }
}

/// Database settings from a PDO DSN such as
/// `mysql:host=db;port=3307;dbname=humhub`.
fn parse_dsn(dsn: &str) -> Option<DatabaseCredentials> {
    let params = dsn.strip_prefix("mysql:")?;
    let mut creds = DatabaseCredentials::default();
    for param in params.split(';') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim() {
            "host" => {
                let (host, port) = split_host_port(value.trim());
                creds.host = host;
                creds.port = creds.port.or(port);
            }
            "port" => creds.port = value.trim().parse().ok(),
            "dbname" => creds.name = value.trim().to_string(),
            _ => {}
        }
    }
    (!creds.host.is_empty() && !creds.name.is_empty()).then_some(creds)
}

/// Title and database settings from the text of `dynamic.php`.
pub fn parse_config(text: &str) -> Result<(String, DatabaseCredentials), String> {
    let config = parse_php_return(text)?;
    let title = config
        .get("name")
        .and_then(PhpValue::as_str)
        .filter(|t| !t.is_empty())
        .ok_or("no title given")?
        .to_string();

    let db = config.path(&["components", "db"]);
    let mut creds = db
        .and_then(|db| db.get("dsn"))
        .and_then(PhpValue::as_str)
        .and_then(parse_dsn)
        .ok_or("no database given")?;
    let field = |key| {
        db.and_then(|db| db.get(key))
            .and_then(PhpValue::as_str)
            .unwrap_or_default()
            .to_string()
    };
    creds.user = field("username");
    creds.password = field("password");
    creds.prefix = field("tablePrefix");
    Ok((title, creds))
}

/// Parse `name<TAB>value` rows of the settings query.
pub fn parse_settings(output: &str) -> Option<SiteInfo> {
    super::parse_name_values(output, "name", "mailer.systemEmailAddress")
}

pub struct HumHub;

impl Detector for HumHub {
    fn name(&self) -> &'static str {
        "HumHub"
    }

    fn config_file(&self) -> &'static str {
        CONFIG_FILE
    }

    fn inspect(&self, text: &str) -> Result<Detected, String> {
        let (title, credentials) = parse_config(text)?;
        Ok(Detected {
            kind: InstanceKind::HumHub,
            credentials,
            site: Some(SiteInfo {
                title,
                admin_email: None,
            }),
        })
    }

    /// Network name and system mail address from the `setting` table.
    fn site_info(&self, credentials: &DatabaseCredentials) -> Option<SiteInfo> {
        let prefix = super::table_prefix(credentials);
        let query = format!(
            "SELECT name, value FROM {prefix}setting \
             WHERE name IN ('name', 'mailer.systemEmailAddress') AND module_id = 'base'"
        );
        let info = parse_settings(&super::query_rows(credentials, &query)?);
        if info.is_none() {
            tracing::warn!("network name not found in {prefix}setting");
        }
        info
    }
}

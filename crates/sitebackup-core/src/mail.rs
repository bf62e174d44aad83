use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};
use crate::platform::shell;

const SENDMAIL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub high_priority: bool,
    pub attachments: Vec<Attachment>,
}

/// A UTF-8 text file sent along with the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    /// MIME type without parameters, e.g. `text/html`.
    pub content_type: String,
    pub content: String,
}

/// Delivers a message somewhere.
pub trait MailTransport {
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Pipes messages into a local `sendmail -oi -t`.
pub struct Sendmail {
    program: PathBuf,
}

impl Sendmail {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl MailTransport for Sendmail {
    fn send(&self, message: &MailMessage) -> Result<()> {
        let raw = render_message(message);
        let mut cmd = Command::new(&self.program);
        cmd.arg("-oi").arg("-t");

        let output = shell::run_command_with_input(&mut cmd, raw.as_bytes(), SENDMAIL_TIMEOUT)
            .map_err(|e| {
                BackupError::Mail(format!("cannot run '{}': {e}", self.program.display()))
            })?;
        if !output.status.success() {
            return Err(BackupError::Mail(format!(
                "'{}' exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// RFC 2047 Q-encoding for non-ASCII header text.
fn encode_header(value: &str) -> String {
    let value = header_value(value);
    if value.is_ascii() {
        return value;
    }
    let mut out = String::from("=?UTF-8?Q?");
    for b in value.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => out.push(b as char),
            b' ' => out.push('_'),
            _ => out.push_str(&format!("={b:02X}")),
        }
    }
    out.push_str("?=");
    out
}

/// Multipart boundary derived from the message content.
fn boundary_for(message: &MailMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.body.as_bytes());
    for attachment in &message.attachments {
        hasher.update(attachment.file_name.as_bytes());
        hasher.update(attachment.content.as_bytes());
    }
    format!("=_sitebackup_{}", &hex::encode(hasher.finalize())[..32])
}

fn push_text(raw: &mut String, text: &str) {
    raw.push_str(text);
    if !text.ends_with('\n') {
        raw.push('\n');
    }
}

/// Render a complete RFC 5322 message with headers. Messages with
/// attachments become `multipart/mixed` with the body as the first part.
pub fn render_message(message: &MailMessage) -> String {
    let mut raw = String::new();
    raw.push_str(&format!("From: {}\n", header_value(&message.from)));
    let to: Vec<String> = message.to.iter().map(|t| header_value(t)).collect();
    raw.push_str(&format!("To: {}\n", to.join(", ")));
    raw.push_str(&format!("Subject: {}\n", encode_header(&message.subject)));
    raw.push_str(&format!("Date: {}\n", Utc::now().to_rfc2822()));
    raw.push_str("MIME-Version: 1.0\n");
    if message.high_priority {
        raw.push_str("X-Priority: 1\n");
        raw.push_str("Importance: high\n");
    }

    if message.attachments.is_empty() {
        raw.push_str("Content-Type: text/plain; charset=utf-8\n");
        raw.push_str("Content-Transfer-Encoding: 8bit\n\n");
        push_text(&mut raw, &message.body);
        return raw;
    }

    let boundary = boundary_for(message);
    raw.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{boundary}\"\n\n"
    ));
    raw.push_str("This is a multi-part message in MIME format.\n");

    raw.push_str(&format!("--{boundary}\n"));
    raw.push_str("Content-Type: text/plain; charset=utf-8\n");
    raw.push_str("Content-Transfer-Encoding: 8bit\n\n");
    push_text(&mut raw, &message.body);

    for attachment in &message.attachments {
        let name = header_value(&attachment.file_name).replace('"', "");
        raw.push_str(&format!("--{boundary}\n"));
        raw.push_str(&format!(
            "Content-Type: {}; charset=utf-8; name=\"{name}\"\n",
            header_value(&attachment.content_type)
        ));
        raw.push_str(&format!(
            "Content-Disposition: attachment; filename=\"{name}\"\n"
        ));
        raw.push_str("Content-Transfer-Encoding: 8bit\n\n");
        push_text(&mut raw, &attachment.content);
    }
    raw.push_str(&format!("--{boundary}--\n"));
    raw
}

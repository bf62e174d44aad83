use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::calendar::Calendar;
use crate::config::MailSettings;
use crate::mail::{Attachment, MailMessage, MailTransport};
use crate::run::{RunReport, TargetOutcome, ThinningSummary};

/// Rendered report, ready for mailing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportText {
    pub subject: String,
    pub body: String,
    /// One archive calendar per target that was listed during the run.
    pub attachments: Vec<Attachment>,
}

/// Formats run reports and hands them to the mail transport, if any.
pub struct Reporter {
    mail: Option<(MailSettings, Box<dyn MailTransport>)>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    /// Reporter that formats but never sends.
    pub fn new() -> Self {
        Self { mail: None }
    }

    pub fn with_mail(settings: MailSettings, transport: Box<dyn MailTransport>) -> Self {
        Self {
            mail: Some((settings, transport)),
        }
    }

    /// Format and, when mail is configured, send the report. Delivery
    /// problems are logged and otherwise ignored.
    pub fn deliver(&self, report: &RunReport) -> ReportText {
        let text = Self::format(report);
        let Some((settings, transport)) = &self.mail else {
            debug!("no mail recipients configured; report not sent");
            return text;
        };
        if settings.to.is_empty() {
            debug!("no mail recipients configured; report not sent");
            return text;
        }

        let message = MailMessage {
            from: settings.from.clone(),
            to: settings.to.clone(),
            subject: text.subject.clone(),
            body: text.body.clone(),
            high_priority: !report.is_success(),
            attachments: text.attachments.clone(),
        };
        match transport.send(&message) {
            Ok(()) => debug!("report mailed to {}", settings.to.join(", ")),
            Err(e) => warn!("could not send report: {e}"),
        }
        text
    }

    /// Render a report. Pure; no I/O.
    pub fn format(report: &RunReport) -> ReportText {
        let status = if report.is_success() { "OK" } else { "FAILED" };
        let dry = if report.dry_run { " (dry run)" } else { "" };
        let subject = format!("[BACKUP] {status}{dry}: {}", report.description);

        let mut body = String::new();
        let _ = writeln!(
            body,
            "Backup report for {} ({})",
            report.description, report.instance
        );
        let _ = writeln!(body);
        let _ = writeln!(body, "    Result:    {status}");
        let _ = writeln!(
            body,
            "    Started:   {}",
            report.started.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(body, "    Duration:  {}", format_elapsed(report.elapsed));
        let _ = writeln!(
            body,
            "    Dry run:   {}",
            if report.dry_run { "yes" } else { "no" }
        );
        let _ = writeln!(body, "    Thinning:  {}", report.thinning);

        if let Some(archive) = &report.archive {
            let _ = writeln!(body, "    Archive:   {}", archive.file_name());
            let _ = writeln!(body, "    Size:      {}", format_bytes(archive.size));
            if let Some(sum) = &archive.checksum {
                let _ = writeln!(body, "    SHA-256:   {sum}");
            }
        } else if report.fatal.is_none() {
            let _ = writeln!(body, "    Archive:   none (thinning only)");
        }

        if let Some(fatal) = &report.fatal {
            let _ = writeln!(body);
            let _ = writeln!(body, "Error: {fatal}");
            let _ = writeln!(body, "No target was attempted.");
            return ReportText {
                subject,
                body,
                attachments: Vec::new(),
            };
        }

        let _ = writeln!(body);
        if report.targets.is_empty() {
            let _ = writeln!(body, "No targets configured.");
        } else {
            let _ = writeln!(body, "Targets:");
        }
        for target in &report.targets {
            let _ = writeln!(
                body,
                "    {} ({}): {}",
                target.name,
                target.location,
                target.outcome.label()
            );
            match &target.outcome {
                TargetOutcome::Succeeded { stored, thinning } => {
                    if let Some(stored) = stored {
                        let _ = writeln!(body, "        stored {}", stored.key);
                    } else if thinning.is_none() {
                        let _ = writeln!(body, "        nothing to do");
                    }
                    write_thinning(&mut body, thinning.as_ref(), false);
                }
                TargetOutcome::Failed {
                    stage,
                    error,
                    stored,
                } => {
                    let _ = writeln!(body, "        stage: {stage}");
                    let _ = writeln!(body, "        error: {error}");
                    if let Some(stored) = stored {
                        let _ = writeln!(body, "        stored {}", stored.key);
                    }
                }
                TargetOutcome::SkippedDry { planned, thinning } => {
                    if let Some(planned) = planned {
                        let _ = writeln!(body, "        would store {}", planned.key);
                    } else if thinning.is_none() {
                        let _ = writeln!(body, "        nothing to do");
                    }
                    write_thinning(&mut body, thinning.as_ref(), true);
                }
            }
        }

        ReportText {
            subject,
            body,
            attachments: calendars(report),
        }
    }
}

/// `<instance>-<target>-calendar.html` for every target with a non-empty
/// listing.
fn calendars(report: &RunReport) -> Vec<Attachment> {
    let today = report.started.date_naive();
    report
        .targets
        .iter()
        .filter_map(|target| {
            let calendar = Calendar::new(target.archives.as_deref()?, today);
            if calendar.is_empty() {
                return None;
            }
            Some(Attachment {
                file_name: format!("{}-{}-calendar.html", report.instance, target.name),
                content_type: "text/html".into(),
                content: calendar.to_html(),
            })
        })
        .collect()
}

fn write_thinning(body: &mut String, thinning: Option<&ThinningSummary>, dry: bool) {
    let Some(summary) = thinning else {
        return;
    };
    let verb = if dry { "would remove" } else { "removed" };
    let _ = writeln!(
        body,
        "        thinning: kept {}, {verb} {}",
        summary.retained.len(),
        summary.removed.len()
    );
    for key in &summary.removed {
        let _ = writeln!(body, "            - {key}");
    }
}

fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    let mins = secs / 60;
    let secs = secs % 60;
    if mins > 0 {
        format!("{mins}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

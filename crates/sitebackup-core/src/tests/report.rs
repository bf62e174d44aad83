use std::path::PathBuf;
use std::time::Duration;

use crate::archive::{ArchiveCompression, ArchiveName, BackupArchive};
use crate::config::MailSettings;
use crate::report::{Reporter, format_bytes};
use crate::run::{RunPhase, RunReport, TargetOutcome, TargetReport, TargetStage, ThinningSummary};
use crate::testutil::{CapturingMail, archive_ref, ts};

fn base_report() -> RunReport {
    let created = ts(2024, 1, 15, 12, 0, 0);
    RunReport {
        instance: "acme".into(),
        description: "WordPress site 'Acme'".into(),
        archive: Some(BackupArchive {
            name: ArchiveName::new("acme", created, ArchiveCompression::Gzip),
            path: PathBuf::from("/tmp/acme-20240115120000.tar.gz"),
            size: 3 * 1024 * 1024,
            checksum: Some("ab".repeat(32)),
        }),
        dry_run: false,
        thinning: "keep-daily-3".into(),
        phase: RunPhase::Done,
        phases: vec![
            RunPhase::Building,
            RunPhase::Distributing,
            RunPhase::Thinning,
            RunPhase::Reporting,
            RunPhase::Done,
        ],
        fatal: None,
        targets: vec![
            TargetReport {
                name: "local".into(),
                location: "/var/backups/acme".into(),
                phase: RunPhase::Distributing,
                archives: None,
                outcome: TargetOutcome::Succeeded {
                    stored: Some(archive_ref("acme", created, "local")),
                    thinning: None,
                },
            },
            TargetReport {
                name: "s3".into(),
                location: "s3.example.com/acme".into(),
                phase: RunPhase::Thinning,
                archives: Some(vec![
                    archive_ref("acme", created, "s3"),
                    archive_ref("acme", ts(2023, 12, 24, 12, 0, 0), "s3"),
                ]),
                outcome: TargetOutcome::Succeeded {
                    stored: Some(archive_ref("acme", created, "s3")),
                    thinning: Some(ThinningSummary {
                        retained: vec!["acme-20240115120000.tar.gz".into()],
                        removed: vec!["acme-20240101120000.tar.gz".into()],
                    }),
                },
            },
        ],
        started: created,
        elapsed: Duration::from_secs(75),
    }
}

fn mail_settings() -> MailSettings {
    MailSettings {
        from: "backup@example.com".into(),
        to: vec!["ops@example.com".into()],
        sendmail: PathBuf::from("/usr/sbin/sendmail"),
    }
}

#[test]
fn success_report() {
    let text = Reporter::format(&base_report());
    assert_eq!(text.subject, "[BACKUP] OK: WordPress site 'Acme'");
    assert!(text.body.contains("    Result:    OK\n"));
    assert!(text.body.contains("    Duration:  1m 15s\n"));
    assert!(text.body.contains("    Size:      3.00 MiB\n"));
    assert!(text.body.contains("    local (/var/backups/acme): Succeeded\n"));
    assert!(text.body.contains("    s3 (s3.example.com/acme): Succeeded\n"));
    assert!(text.body.contains("thinning: kept 1, removed 1"));
    assert!(text.body.contains("- acme-20240101120000.tar.gz"));
}

#[test]
fn failed_target_report() {
    let mut report = base_report();
    report.targets[1].outcome = TargetOutcome::Failed {
        stage: TargetStage::Store,
        error: "transfer to 's3' failed: 403 Forbidden".into(),
        stored: None,
    };

    let text = Reporter::format(&report);
    assert!(text.subject.starts_with("[BACKUP] FAILED: "));
    assert!(text.body.contains("    s3 (s3.example.com/acme): Failed\n"));
    assert!(text.body.contains("        stage: store\n"));
    assert!(text.body.contains("403 Forbidden"));
    assert!(text.body.contains("    local (/var/backups/acme): Succeeded\n"));
}

#[test]
fn dry_run_report() {
    let mut report = base_report();
    report.dry_run = true;
    let created = ts(2024, 1, 15, 12, 0, 0);
    report.targets[1].outcome = TargetOutcome::SkippedDry {
        planned: Some(archive_ref("acme", created, "s3")),
        thinning: Some(ThinningSummary {
            retained: vec!["acme-20240115120000.tar.gz".into()],
            removed: vec!["acme-20240101120000.tar.gz".into()],
        }),
    };

    let text = Reporter::format(&report);
    assert_eq!(text.subject, "[BACKUP] OK (dry run): WordPress site 'Acme'");
    assert!(text.body.contains("SkippedDry"));
    assert!(text.body.contains("would store acme-20240115120000.tar.gz"));
    assert!(text.body.contains("would remove 1"));
}

#[test]
fn fatal_report_names_the_error() {
    let mut report = base_report();
    report.archive = None;
    report.targets.clear();
    report.phase = RunPhase::AbortedBeforeDistribution;
    report.fatal = Some("database dump failed: access denied".into());

    let text = Reporter::format(&report);
    assert!(text.subject.starts_with("[BACKUP] FAILED"));
    assert!(text.body.contains("Error: database dump failed: access denied\n"));
    assert!(text.body.contains("No target was attempted."));
}

#[test]
fn deliver_marks_failures_high_priority() {
    let mail = CapturingMail::default();
    let reporter = Reporter::with_mail(mail_settings(), Box::new(mail.clone()));

    let mut report = base_report();
    report.fatal = Some("boom".into());
    let text = reporter.deliver(&report);

    let sent = mail.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].high_priority);
    assert_eq!(sent[0].subject, text.subject);
    assert_eq!(sent[0].to, vec!["ops@example.com".to_string()]);
}

#[test]
fn mail_failure_is_not_fatal() {
    let mail = CapturingMail {
        fail: true,
        ..Default::default()
    };
    let reporter = Reporter::with_mail(mail_settings(), Box::new(mail.clone()));
    let text = reporter.deliver(&base_report());
    assert!(text.subject.contains("OK"));
    assert!(mail.sent.lock().unwrap().is_empty());
}

#[test]
fn no_recipients_means_no_mail() {
    let mail = CapturingMail::default();
    let mut settings = mail_settings();
    settings.to.clear();
    let reporter = Reporter::with_mail(settings, Box::new(mail.clone()));
    reporter.deliver(&base_report());
    assert!(mail.sent.lock().unwrap().is_empty());
}

#[test]
fn listed_targets_get_a_calendar() {
    let text = Reporter::format(&base_report());
    assert_eq!(text.attachments.len(), 1);
    let calendar = &text.attachments[0];
    assert_eq!(calendar.file_name, "acme-s3-calendar.html");
    assert_eq!(calendar.content_type, "text/html");
    assert!(calendar.content.starts_with("<!DOCTYPE HTML>"));
    assert!(calendar.content.contains("class=\"year\">2023</th>"));
    assert!(calendar.content.contains("class=\"year\">2024</th>"));
    // The run's own day is today on the calendar.
    assert!(calendar.content.contains("today hasarchive"));
}

#[test]
fn calendars_are_mailed_as_attachments() {
    let mail = CapturingMail::default();
    let reporter = Reporter::with_mail(mail_settings(), Box::new(mail.clone()));
    reporter.deliver(&base_report());

    let sent = mail.sent.lock().unwrap();
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].file_name, "acme-s3-calendar.html");
}

#[test]
fn empty_listing_gets_no_calendar() {
    let mut report = base_report();
    report.targets[1].archives = Some(Vec::new());
    assert!(Reporter::format(&report).attachments.is_empty());
}

#[test]
fn thinning_only_report() {
    let mut report = base_report();
    report.archive = None;
    report.targets[0].outcome = TargetOutcome::Succeeded {
        stored: None,
        thinning: None,
    };
    report.targets[1].outcome = TargetOutcome::Succeeded {
        stored: None,
        thinning: Some(ThinningSummary {
            retained: vec!["acme-20240114120000.tar.gz".into()],
            removed: vec!["acme-20240101120000.tar.gz".into()],
        }),
    };

    let text = Reporter::format(&report);
    assert_eq!(text.subject, "[BACKUP] OK: WordPress site 'Acme'");
    assert!(text.body.contains("    Archive:   none (thinning only)\n"));
    assert!(text.body.contains("        nothing to do\n"));
    assert!(text.body.contains("thinning: kept 1, removed 1"));
    assert!(!text.body.contains("stored "));
}

#[test]
fn byte_formatting() {
    assert_eq!(format_bytes(512), "512 B");
    assert_eq!(format_bytes(1536), "1.50 KiB");
    assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GiB");
}

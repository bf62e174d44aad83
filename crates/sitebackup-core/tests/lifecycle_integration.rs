use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use sitebackup_core::archive::{ArchiveBuilder, ArchiveCompression, ArchiveSources};
use sitebackup_core::config::{BackupConfig, FileConfig, Overrides};
use sitebackup_core::database::CommandDump;
use sitebackup_core::report::Reporter;
use sitebackup_core::run::{BackupRun, RunReport, TargetOutcome};
use sitebackup_core::target::{LocalTarget, ObjectStorageTarget, Target};
use sitebackup_core::thinning::ThinningStrategy;
use sitebackup_storage::{ObjectInfo, ObjectStore, StorageError};

static TEST_ENV_INIT: Once = Once::new();

fn init_test_environment() {
    TEST_ENV_INIT.call_once(|| {
        let base = std::env::temp_dir().join(format!("sitebackup-tests-{}", std::process::id()));
        let home = base.join("home");
        let _ = std::fs::create_dir_all(&home);
        unsafe {
            std::env::set_var("HOME", &home);
            std::env::remove_var("SITEBACKUP_CONFIG");
        }
    });
}

/// Bucket double shared between the test and the target under test.
#[derive(Clone, Default)]
struct FakeBucket {
    objects: Arc<Mutex<BTreeMap<String, u64>>>,
    fail_uploads: bool,
}

impl FakeBucket {
    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn seed(&self, key: &str) {
        self.objects.lock().unwrap().insert(key.to_string(), 1024);
    }
}

impl ObjectStore for FakeBucket {
    fn put_file(&self, key: &str, path: &Path) -> sitebackup_storage::Result<u64> {
        if self.fail_uploads {
            return Err(StorageError::Request {
                op: format!("PUT {key}"),
                message: "HTTP 503 after 3 retries".into(),
            });
        }
        let size = std::fs::metadata(path)?.len();
        self.objects.lock().unwrap().insert(key.to_string(), size);
        Ok(size)
    }

    fn list(&self, prefix: &str) -> sitebackup_storage::Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, size)| ObjectInfo {
                key: k.clone(),
                size: *size,
            })
            .collect())
    }

    fn delete(&self, key: &str) -> sitebackup_storage::Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "fake/acme".into()
    }
}

struct Fixture {
    site: tempfile::TempDir,
    attic: tempfile::TempDir,
    scratch: tempfile::TempDir,
    bucket: FakeBucket,
}

impl Fixture {
    fn new() -> Self {
        init_test_environment();
        let site = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(site.path().join("wp-content/uploads/2024")).unwrap();
        std::fs::write(site.path().join("index.php"), "<?php // front").unwrap();
        std::fs::write(
            site.path().join("wp-content/uploads/2024/photo.jpg"),
            vec![7u8; 4096],
        )
        .unwrap();
        Self {
            site,
            attic: tempfile::tempdir().unwrap(),
            scratch: tempfile::tempdir().unwrap(),
            bucket: FakeBucket::default(),
        }
    }

    fn sources(&self) -> ArchiveSources {
        ArchiveSources {
            instance_id: "acme".into(),
            description: "site 'acme'".into(),
            database: Some(Box::new(CommandDump::new(
                "printf 'CREATE TABLE wp_posts (id int);\\n'".into(),
                Duration::from_secs(30),
            ))),
            filesystem: Some(self.site.path().to_path_buf()),
            excludes: Vec::new(),
        }
    }

    fn targets(&self) -> Vec<Box<dyn Target>> {
        vec![
            Box::new(LocalTarget::new("local", self.attic.path(), "acme")),
            Box::new(ObjectStorageTarget::new(
                "s3",
                "acme",
                Box::new(self.bucket.clone()),
            )),
        ]
    }

    fn run(&self, thinning: ThinningStrategy, dry_run: bool, now: DateTime<Utc>) -> RunReport {
        let builder = ArchiveBuilder::new(self.scratch.path(), ArchiveCompression::Gzip, None);
        BackupRun::new(builder, self.sources(), self.targets(), thinning, dry_run)
            .execute(&Reporter::new(), now)
    }

    fn run_thinning_only(&self, thinning: ThinningStrategy, now: DateTime<Utc>) -> RunReport {
        let builder = ArchiveBuilder::new(self.scratch.path(), ArchiveCompression::Gzip, None);
        let sources = ArchiveSources {
            database: None,
            filesystem: None,
            ..self.sources()
        };
        BackupRun::new(builder, sources, self.targets(), thinning, false)
            .execute(&Reporter::new(), now)
    }

    fn attic_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.attic.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }
}

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
}

#[cfg(unix)]
#[test]
fn backup_reaches_local_and_remote() {
    let fx = Fixture::new();
    let report = fx.run(ThinningStrategy::None, false, at(15));

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.exit_code(), 0);
    let labels: Vec<_> = report.targets.iter().map(|t| t.outcome.label()).collect();
    assert_eq!(labels, vec!["Succeeded", "Succeeded"]);

    assert_eq!(fx.attic_files(), vec!["acme-20240115120000.tar.gz"]);
    assert_eq!(fx.bucket.keys(), vec!["acme-20240115120000.tar.gz"]);

    let local_copy = fx.attic.path().join("acme-20240115120000.tar.gz");
    let archive = report.archive.as_ref().unwrap();
    assert_eq!(std::fs::metadata(&local_copy).unwrap().len(), archive.size);
    assert_eq!(
        sitebackup_core::archive::sha256_file(&local_copy).unwrap(),
        archive.checksum.clone().unwrap()
    );
    assert!(fx.scratch_is_empty());
}

#[cfg(unix)]
#[test]
fn remote_thinning_keeps_three_days() {
    let fx = Fixture::new();
    for day in 2..=10 {
        fx.bucket.seed(&format!("acme-202401{day:02}120000.tar.gz"));
    }
    fx.bucket.seed("unrelated-20240101120000.tar.gz");
    fx.bucket.seed("acme-notes.txt");

    let report = fx.run("keep-daily-3".parse().unwrap(), false, at(11));
    assert!(report.is_success(), "{report:?}");

    let TargetOutcome::Succeeded {
        thinning: Some(summary),
        ..
    } = &report.targets[1].outcome
    else {
        panic!("unexpected outcome {:?}", report.targets[1].outcome);
    };
    assert_eq!(summary.retained.len(), 3);
    assert_eq!(summary.removed.len(), 7);

    assert_eq!(
        fx.bucket.keys(),
        vec![
            "acme-20240109120000.tar.gz",
            "acme-20240110120000.tar.gz",
            "acme-20240111120000.tar.gz",
            "acme-notes.txt",
            "unrelated-20240101120000.tar.gz",
        ]
    );
}

#[cfg(unix)]
#[test]
fn local_attic_is_never_thinned() {
    let fx = Fixture::new();
    for day in 1..=4 {
        std::fs::write(
            fx.attic.path().join(format!("acme-202401{day:02}120000.tar.gz")),
            b"old",
        )
        .unwrap();
    }

    let report = fx.run(ThinningStrategy::Latest(1), false, at(5));
    assert!(report.is_success());
    assert_eq!(fx.attic_files().len(), 5);
}

#[cfg(unix)]
#[test]
fn failed_upload_does_not_affect_local_copy() {
    let mut fx = Fixture::new();
    fx.bucket.fail_uploads = true;

    let report = fx.run(ThinningStrategy::Latest(2), false, at(15));

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.targets[0].outcome.label(), "Succeeded");
    assert_eq!(report.targets[1].outcome.label(), "Failed");
    assert_eq!(fx.attic_files(), vec!["acme-20240115120000.tar.gz"]);
    assert!(fx.bucket.keys().is_empty());
    assert!(fx.scratch_is_empty());

    let text = Reporter::format(&report);
    assert!(text.subject.starts_with("[BACKUP] FAILED"));
    assert!(text.body.contains("HTTP 503"));
}

#[cfg(unix)]
#[test]
fn dry_run_leaves_everything_untouched() {
    let fx = Fixture::new();
    fx.bucket.seed("acme-20240101120000.tar.gz");
    fx.bucket.seed("acme-20240102120000.tar.gz");

    let report = fx.run(ThinningStrategy::Latest(1), true, at(15));

    assert!(report.is_success());
    assert!(
        report
            .targets
            .iter()
            .all(|t| t.outcome.label() == "SkippedDry")
    );
    assert!(fx.attic_files().is_empty());
    assert_eq!(fx.bucket.keys().len(), 2);
    assert!(fx.scratch_is_empty());
}

#[cfg(unix)]
#[test]
fn repeated_runs_are_idempotent_for_thinning() {
    let fx = Fixture::new();
    fx.run("keep-last-2".parse().unwrap(), false, at(10));
    fx.run("keep-last-2".parse().unwrap(), false, at(11));
    fx.run("keep-last-2".parse().unwrap(), false, at(12));
    assert_eq!(
        fx.bucket.keys(),
        vec!["acme-20240111120000.tar.gz", "acme-20240112120000.tar.gz"]
    );
    assert_eq!(fx.attic_files().len(), 3);
}

#[test]
fn run_from_resolved_config() {
    let fx = Fixture::new();
    let overrides = Overrides {
        path: fx.site.path().to_path_buf(),
        include_filesystem: true,
        label: Some("Acme Corp".into()),
        attic: Some(fx.attic.path().to_string_lossy().into()),
        scratch_dir: Some(fx.scratch.path().to_string_lossy().into()),
        ..Default::default()
    };
    let config = BackupConfig::resolve(FileConfig::default(), overrides).unwrap();
    assert_eq!(config.instance.slug, "acme-corp");

    let now = Utc::now();
    let report = BackupRun::from_config(&config)
        .unwrap()
        .execute(&Reporter::new(), now);

    assert!(report.is_success(), "{report:?}");
    let files = fx.attic_files();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("acme-corp-"));
    assert!(files[0].ends_with(".tar.gz"));
    assert!(fx.scratch_is_empty());
}

#[test]
fn thinning_only_run_prunes_remote_and_reports_calendar() {
    let fx = Fixture::new();
    for day in 1..=6 {
        fx.bucket.seed(&format!("acme-202401{day:02}120000.tar.gz"));
    }

    let report = fx.run_thinning_only(ThinningStrategy::Latest(2), at(7));

    assert!(report.is_success(), "{report:?}");
    assert!(report.archive.is_none());
    assert!(fx.attic_files().is_empty());
    assert!(fx.scratch_is_empty());
    assert_eq!(
        fx.bucket.keys(),
        vec!["acme-20240105120000.tar.gz", "acme-20240106120000.tar.gz"]
    );

    let text = Reporter::format(&report);
    let names: Vec<_> = text.attachments.iter().map(|a| a.file_name.as_str()).collect();
    assert_eq!(names, vec!["acme-s3-calendar.html"]);
    assert_eq!(
        text.attachments[0].content.matches(" hasarchive\"").count(),
        2
    );
}

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveBuilder, ArchiveSources, BackupArchive};
use crate::config::BackupConfig;
use crate::database::dumper_from_settings;
use crate::error::Result;
use crate::report::Reporter;
use crate::target::{StoredArchiveRef, Target, targets_from_config};
use crate::thinning::{ThinningDecision, ThinningStrategy};

/// Lifecycle of one run. A run without an archive to build starts at
/// `Thinning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Building,
    Distributing,
    Thinning,
    Reporting,
    Done,
    /// The archive could not be built; no target was touched.
    AbortedBeforeDistribution,
}

/// Step of a target's processing that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStage {
    Store,
    List,
    Delete,
    /// The run was interrupted before the target was reached.
    Interrupted,
}

impl fmt::Display for TargetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetStage::Store => "store",
            TargetStage::List => "list",
            TargetStage::Delete => "delete",
            TargetStage::Interrupted => "interrupted",
        })
    }
}

/// What thinning kept and removed on one target. In a dry run `removed`
/// holds what would have been removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinningSummary {
    pub retained: Vec<String>,
    pub removed: Vec<String>,
}

impl ThinningSummary {
    fn planned(decision: &ThinningDecision) -> Self {
        Self {
            retained: decision.retain.iter().map(|r| r.key.clone()).collect(),
            removed: decision.remove.iter().map(|r| r.key.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// `stored` is `None` when the run had no archive to distribute.
    Succeeded {
        stored: Option<StoredArchiveRef>,
        thinning: Option<ThinningSummary>,
    },
    Failed {
        stage: TargetStage,
        error: String,
        /// Set when the archive was stored before a later step failed.
        stored: Option<StoredArchiveRef>,
    },
    /// Dry run: nothing was written or deleted.
    SkippedDry {
        planned: Option<StoredArchiveRef>,
        thinning: Option<ThinningSummary>,
    },
}

impl TargetOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TargetOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TargetOutcome::Succeeded { .. } => "Succeeded",
            TargetOutcome::Failed { .. } => "Failed",
            TargetOutcome::SkippedDry { .. } => "SkippedDry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub name: String,
    pub location: String,
    /// Furthest phase this target reached.
    pub phase: RunPhase,
    /// Archives on the target once the run was done with it, when it was
    /// listed. A dry run records the listing as found.
    pub archives: Option<Vec<StoredArchiveRef>>,
    pub outcome: TargetOutcome,
}

/// Everything that happened in one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub instance: String,
    pub description: String,
    /// Metadata of the archive built; its local file is gone by now.
    pub archive: Option<BackupArchive>,
    pub dry_run: bool,
    pub thinning: String,
    /// Phase the run ended in.
    pub phase: RunPhase,
    /// Every phase entered, in order.
    pub phases: Vec<RunPhase>,
    /// Error that stopped the run before distribution.
    pub fatal: Option<String>,
    pub targets: Vec<TargetReport>,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && !self.targets.iter().any(|t| t.outcome.is_failed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| t.outcome.is_failed())
    }

    fn enter(&mut self, phase: RunPhase) {
        if self.phases.last() != Some(&phase) {
            debug!("run phase: {phase:?}");
            self.phases.push(phase);
        }
        self.phase = phase;
    }
}

/// Per-target bookkeeping filled in while a target is processed.
struct TargetProgress {
    phase: RunPhase,
    archives: Option<Vec<StoredArchiveRef>>,
}

/// Orchestrates one backup: build the archive, hand it to every target in
/// turn, thin remote targets, report. With no database and no filesystem
/// requested the build and store steps are skipped and only thinning runs.
///
/// Targets are processed sequentially and independently: a failing target
/// is recorded and the next one is processed regardless.
pub struct BackupRun<'a> {
    builder: ArchiveBuilder,
    sources: ArchiveSources,
    targets: Vec<Box<dyn Target>>,
    thinning: ThinningStrategy,
    dry_run: bool,
    abort: Option<&'a AtomicBool>,
    // Removed on drop together with anything left inside.
    _scratch: Option<TempDir>,
}

impl<'a> BackupRun<'a> {
    pub fn new(
        builder: ArchiveBuilder,
        sources: ArchiveSources,
        targets: Vec<Box<dyn Target>>,
        thinning: ThinningStrategy,
        dry_run: bool,
    ) -> Self {
        Self {
            builder,
            sources,
            targets,
            thinning,
            dry_run,
            abort: None,
            _scratch: None,
        }
    }

    /// Assemble a run from resolved configuration. The archive is built in a
    /// private directory created under the configured scratch directory.
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.scratch_dir)?;
        let scratch = tempfile::Builder::new()
            .prefix("sitebackup-")
            .tempdir_in(&config.scratch_dir)?;

        let builder = ArchiveBuilder::new(
            scratch.path(),
            config.compression,
            config.compression_level,
        );

        let mut excludes: Vec<PathBuf> = vec![scratch.path().to_path_buf()];
        excludes.extend(config.attic.iter().cloned());

        let sources = ArchiveSources {
            instance_id: config.instance.slug.clone(),
            description: config.instance.description(),
            database: if config.include_database {
                config.database.as_ref().map(dumper_from_settings)
            } else {
                None
            },
            filesystem: config
                .include_filesystem
                .then(|| config.instance.path.clone()),
            excludes,
        };

        let targets = targets_from_config(config)?;
        let mut run = Self::new(
            builder,
            sources,
            targets,
            config.thinning.clone(),
            config.dry_run,
        );
        run._scratch = Some(scratch);
        Ok(run)
    }

    /// Stop between targets once `flag` is set.
    pub fn with_abort_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.abort = Some(flag);
        self
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn aborted(&self) -> bool {
        self.abort.is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Run to completion. Always returns a report, and always passes it to
    /// `reporter`, whatever failed along the way.
    pub fn execute(self, reporter: &Reporter, now: DateTime<Utc>) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport {
            instance: self.sources.instance_id.clone(),
            description: self.sources.description.clone(),
            archive: None,
            dry_run: self.dry_run,
            thinning: self.thinning.to_string(),
            phase: RunPhase::Building,
            phases: Vec::new(),
            fatal: None,
            targets: Vec::new(),
            started: now,
            elapsed: Duration::ZERO,
        };

        let archive = if self.sources.is_empty() {
            info!(
                "no archive requested for {}; thinning existing archives only",
                self.sources.description
            );
            None
        } else {
            report.enter(RunPhase::Building);
            info!("building archive for {}", self.sources.description);
            match self.builder.build(&self.sources, now) {
                Ok(archive) => Some(archive),
                Err(e) => {
                    error!("backup aborted: {e}");
                    report.enter(RunPhase::AbortedBeforeDistribution);
                    report.fatal = Some(e.to_string());
                    report.elapsed = start.elapsed();
                    reporter.deliver(&report);
                    return report;
                }
            }
        };

        for target in &self.targets {
            let mut progress = TargetProgress {
                phase: if archive.is_some() {
                    RunPhase::Distributing
                } else {
                    RunPhase::Thinning
                },
                archives: None,
            };
            report.enter(progress.phase);
            let outcome = if self.aborted() {
                warn!("run interrupted; skipping target '{}'", target.name());
                TargetOutcome::Failed {
                    stage: TargetStage::Interrupted,
                    error: "run interrupted before this target was processed".into(),
                    stored: None,
                }
            } else {
                self.process_target(target.as_ref(), archive.as_ref(), now, &mut progress)
            };
            report.enter(progress.phase);
            if let TargetOutcome::Failed { stage, error, .. } = &outcome {
                error!("target '{}' failed at {stage}: {error}", target.name());
            }
            report.targets.push(TargetReport {
                name: target.name().to_string(),
                location: target.describe(),
                phase: progress.phase,
                archives: progress.archives,
                outcome,
            });
        }

        report.enter(RunPhase::Reporting);
        if let Some(archive) = &archive {
            if let Err(e) = archive.remove_local() {
                warn!("could not remove local archive {}: {e}", archive.path.display());
            }
        }
        report.archive = archive;
        report.elapsed = start.elapsed();
        reporter.deliver(&report);

        report.enter(RunPhase::Done);
        report
    }

    fn process_target(
        &self,
        target: &dyn Target,
        archive: Option<&BackupArchive>,
        now: DateTime<Utc>,
        progress: &mut TargetProgress,
    ) -> TargetOutcome {
        let name = target.name();
        let wants_thinning =
            target.supports_thinning() && self.thinning != ThinningStrategy::None;

        let current = match archive {
            Some(archive) if self.dry_run => {
                let planned = StoredArchiveRef::for_archive(name, archive);
                info!("[dry] would store {} on '{name}'", planned.key);
                Some(planned)
            }
            Some(archive) => match target.store(archive) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    return TargetOutcome::Failed {
                        stage: TargetStage::Store,
                        error: e.to_string(),
                        stored: None,
                    };
                }
            },
            None => None,
        };

        let thinning = if wants_thinning {
            progress.phase = RunPhase::Thinning;
            match self.thin_target(target, current.as_ref(), now, progress) {
                Ok(summary) => Some(summary),
                Err((stage, error)) => {
                    return TargetOutcome::Failed {
                        stage,
                        error,
                        stored: if self.dry_run { None } else { current },
                    };
                }
            }
        } else {
            None
        };

        if self.dry_run {
            TargetOutcome::SkippedDry {
                planned: current,
                thinning,
            }
        } else {
            TargetOutcome::Succeeded {
                stored: current,
                thinning,
            }
        }
    }

    /// List `target`, decide what to keep and delete the rest (dry run:
    /// only report it). Each removal is attempted exactly once.
    fn thin_target(
        &self,
        target: &dyn Target,
        current: Option<&StoredArchiveRef>,
        now: DateTime<Utc>,
        progress: &mut TargetProgress,
    ) -> std::result::Result<ThinningSummary, (TargetStage, String)> {
        let name = target.name();
        let listing = target
            .list()
            .map_err(|e| (TargetStage::List, e.to_string()))?;
        let decision = self.plan_thinning(listing.clone(), current, now);

        if self.dry_run {
            for r in &decision.remove {
                info!("[dry] would delete {} from '{name}'", r.key);
            }
            progress.archives = Some(listing);
            return Ok(ThinningSummary::planned(&decision));
        }

        let mut removed = Vec::new();
        let mut errors = Vec::new();
        for victim in &decision.remove {
            match target.delete(victim) {
                Ok(()) => {
                    info!("deleted {} from '{name}'", victim.key);
                    removed.push(victim.key.clone());
                }
                Err(e) => errors.push(format!("{}: {e}", victim.key)),
            }
        }

        let mut remaining = decision.retain.clone();
        remaining.extend(
            decision
                .remove
                .iter()
                .filter(|r| !removed.contains(&r.key))
                .cloned(),
        );
        progress.archives = Some(remaining);

        if !errors.is_empty() {
            return Err((
                TargetStage::Delete,
                format!(
                    "{} of {} deletions failed: {}",
                    errors.len(),
                    decision.remove.len(),
                    errors.join("; ")
                ),
            ));
        }

        Ok(ThinningSummary {
            retained: decision.retain.iter().map(|r| r.key.clone()).collect(),
            removed,
        })
    }

    /// Decide what to keep from `refs`. The current archive, if any, is
    /// added when missing and is never selected for removal.
    fn plan_thinning(
        &self,
        mut refs: Vec<StoredArchiveRef>,
        current: Option<&StoredArchiveRef>,
        now: DateTime<Utc>,
    ) -> ThinningDecision {
        let Some(current) = current else {
            return self.thinning.select(&refs, now);
        };
        if !refs.iter().any(|r| r.key == current.key) {
            refs.push(current.clone());
        }

        let mut decision = self.thinning.select(&refs, now);
        protect_current(&mut decision, &current.key);
        decision
    }
}

fn protect_current(decision: &mut ThinningDecision, key: &str) {
    if let Some(pos) = decision.remove.iter().position(|r| r.key == key) {
        warn!("thinning selected the archive just created ({key}); keeping it");
        let current = decision.remove.remove(pos);
        decision
            .reasons
            .entry(current.key.clone())
            .or_default()
            .push("current run".into());
        let at = decision
            .retain
            .iter()
            .position(|r| (r.created, &r.key) < (current.created, &current.key))
            .unwrap_or(decision.retain.len());
        decision.retain.insert(at, current);
    }
}

use sitebackup_core::report::format_bytes;
use sitebackup_core::run::{RunReport, TargetOutcome, ThinningSummary};

use crate::table::{CliTableTheme, add_kv_row};

fn thinning_detail(thinning: Option<&ThinningSummary>, dry: bool) -> Option<String> {
    let summary = thinning?;
    let verb = if dry { "would remove" } else { "removed" };
    Some(format!(
        "kept {}, {verb} {}",
        summary.retained.len(),
        summary.removed.len()
    ))
}

fn join_detail(first: Option<String>, second: Option<String>) -> String {
    match (first, second) {
        (Some(a), Some(b)) => format!("{a}; {b}"),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => "nothing to do".into(),
    }
}

fn outcome_detail(outcome: &TargetOutcome) -> String {
    match outcome {
        TargetOutcome::Succeeded { stored, thinning } => join_detail(
            stored.as_ref().map(|s| format!("stored {}", s.key)),
            thinning_detail(thinning.as_ref(), false),
        ),
        TargetOutcome::Failed { stage, error, .. } => format!("{stage}: {error}"),
        TargetOutcome::SkippedDry { planned, thinning } => join_detail(
            planned.as_ref().map(|p| format!("would store {}", p.key)),
            thinning_detail(thinning.as_ref(), true),
        ),
    }
}

/// Render the end-of-run summary: a key/value block followed by one row per
/// target.
pub(crate) fn render_summary(report: &RunReport, theme: CliTableTheme) -> String {
    let mut kv = theme.new_kv_table();
    add_kv_row(&mut kv, theme, "Instance", &report.description);
    if let Some(archive) = &report.archive {
        add_kv_row(&mut kv, theme, "Archive", archive.file_name());
        add_kv_row(&mut kv, theme, "Size", format_bytes(archive.size));
    } else if report.fatal.is_none() {
        add_kv_row(&mut kv, theme, "Archive", "none (thinning only)");
    }
    add_kv_row(&mut kv, theme, "Thinning", &report.thinning);
    if report.dry_run {
        add_kv_row(&mut kv, theme, "Dry run", "yes");
    }
    let secs = report.elapsed.as_secs();
    let duration = if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    };
    add_kv_row(&mut kv, theme, "Duration", duration);

    let mut out = kv.to_string();
    out.push('\n');

    if let Some(fatal) = &report.fatal {
        out.push_str(&format!("\nBackup aborted: {fatal}\n"));
        return out;
    }
    if report.targets.is_empty() {
        if report.archive.is_some() {
            out.push_str("\nNo targets configured; the archive was discarded.\n");
        } else {
            out.push_str("\nNo targets configured.\n");
        }
        return out;
    }

    let mut table = theme.new_data_table(&["Target", "Location", "Outcome", "Detail"]);
    for target in &report.targets {
        table.add_row(vec![
            comfy_table::Cell::new(&target.name),
            comfy_table::Cell::new(&target.location),
            theme.outcome_cell(target.outcome.label(), target.outcome.is_failed()),
            comfy_table::Cell::new(outcome_detail(&target.outcome)),
        ]);
    }
    out.push('\n');
    out.push_str(&table.to_string());
    out.push('\n');
    out
}

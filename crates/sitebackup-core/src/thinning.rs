use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, IsoWeek, Months, NaiveDate, Timelike, Utc};

use crate::error::{BackupError, Result};
use crate::target::StoredArchiveRef;

/// Which existing archives a target keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ThinningStrategy {
    /// Keep everything.
    #[default]
    None,
    /// Keep the `n` most recent archives (`L<n>`).
    Latest(usize),
    /// `<d>D<w>W<m>M`: keep today's archives and the newest overall, then the
    /// oldest archive of each of the previous `days` days, of each of the
    /// `weeks` weeks before those, everything in the partial month before
    /// that, the oldest of each of `months` months, and one per year beyond.
    ThinOut { days: u32, weeks: u32, months: u32 },
    /// Bucket rules such as `keep-daily-7,keep-weekly-4`.
    Retention(RetentionPolicy),
}

/// Bucket-based retention. Each bucket keeps its most recent archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_within: Option<chrono::Duration>,
    pub keep_last: Option<usize>,
    pub keep_hourly: Option<usize>,
    pub keep_daily: Option<usize>,
    pub keep_weekly: Option<usize>,
    pub keep_monthly: Option<usize>,
    pub keep_yearly: Option<usize>,
}

impl RetentionPolicy {
    pub fn has_any_rule(&self) -> bool {
        self.keep_within.is_some()
            || self.keep_last.is_some()
            || self.keep_hourly.is_some()
            || self.keep_daily.is_some()
            || self.keep_weekly.is_some()
            || self.keep_monthly.is_some()
            || self.keep_yearly.is_some()
    }
}

/// Partition of a target's listing. Both halves are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinningDecision {
    pub retain: Vec<StoredArchiveRef>,
    pub remove: Vec<StoredArchiveRef>,
    /// Why each retained key was kept.
    pub reasons: BTreeMap<String, Vec<String>>,
}

impl ThinningDecision {
    pub fn is_retained(&self, key: &str) -> bool {
        self.retain.iter().any(|r| r.key == key)
    }
}

/// Parse a duration string like "2d", "48h", "1w", "6m", "1y".
/// Pure numeric values are treated as days. The amount must be positive
/// and representable as a `chrono::Duration`.
pub fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BackupError::Config("empty duration string".into()));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(split);
    let n: i64 = num_str
        .parse()
        .map_err(|_| BackupError::Config(format!("invalid duration number: '{s}'")))?;
    if n <= 0 {
        return Err(BackupError::Config(format!(
            "duration must be positive: '{s}'"
        )));
    }

    let span = match suffix {
        "h" | "H" => chrono::Duration::try_hours(n),
        "" | "d" | "D" => chrono::Duration::try_days(n),
        "w" | "W" => chrono::Duration::try_weeks(n),
        "m" | "M" => n.checked_mul(30).and_then(chrono::Duration::try_days),
        "y" | "Y" => n.checked_mul(365).and_then(chrono::Duration::try_days),
        _ => {
            return Err(BackupError::Config(format!(
                "unknown duration suffix: '{suffix}'"
            )));
        }
    };
    span.ok_or_else(|| BackupError::Config(format!("duration too large: '{s}'")))
}

fn format_duration(d: &chrono::Duration) -> String {
    if d.num_hours() % 24 == 0 {
        format!("{}d", d.num_days())
    } else {
        format!("{}h", d.num_hours())
    }
}

fn parse_count(rule: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(BackupError::Config(format!(
            "invalid thinning rule '{rule}': expected a positive count"
        ))),
    }
}

/// `<d>D<w>W<m>M`, case-insensitive. `None` when `s` has a different shape.
fn parse_thin_out(s: &str) -> Option<Result<(u32, u32, u32)>> {
    let upper = s.to_ascii_uppercase();
    let (days, rest) = upper.split_once('D')?;
    let (weeks, rest) = rest.split_once('W')?;
    let months = rest.strip_suffix('M')?;
    let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if !(all_digits(days) && all_digits(weeks) && all_digits(months)) {
        return None;
    }
    let count = |p: &str| match p.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(BackupError::Config(format!(
            "invalid thinning strategy '{s}': day, week and month counts must be positive"
        ))),
    };
    Some(count(days).and_then(|d| Ok((d, count(weeks)?, count(months)?))))
}

impl FromStr for ThinningStrategy {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(ThinningStrategy::None);
        }

        if let Some(n) = s.strip_prefix('L').or_else(|| s.strip_prefix('l')) {
            if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(ThinningStrategy::Latest(parse_count(s, n)?));
            }
        }

        if let Some(counts) = parse_thin_out(s) {
            let (days, weeks, months) = counts?;
            return Ok(ThinningStrategy::ThinOut {
                days,
                weeks,
                months,
            });
        }

        let mut policy = RetentionPolicy::default();
        for rule in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let Some(body) = rule.strip_prefix("keep-") else {
                return Err(BackupError::Config(format!(
                    "unknown thinning strategy '{rule}' (expected none, L<n>, <d>D<w>W<m>M or keep-<rule>-<n>)"
                )));
            };
            let Some((kind, value)) = body.split_once('-') else {
                return Err(BackupError::Config(format!(
                    "invalid thinning rule '{rule}'"
                )));
            };
            match kind {
                "within" => policy.keep_within = Some(parse_duration(value)?),
                "last" => policy.keep_last = Some(parse_count(rule, value)?),
                "hourly" => policy.keep_hourly = Some(parse_count(rule, value)?),
                "daily" => policy.keep_daily = Some(parse_count(rule, value)?),
                "weekly" => policy.keep_weekly = Some(parse_count(rule, value)?),
                "monthly" => policy.keep_monthly = Some(parse_count(rule, value)?),
                "yearly" => policy.keep_yearly = Some(parse_count(rule, value)?),
                other => {
                    return Err(BackupError::Config(format!(
                        "unknown thinning rule 'keep-{other}'"
                    )));
                }
            }
        }

        if !policy.has_any_rule() {
            return Err(BackupError::Config(format!(
                "thinning strategy '{s}' contains no rules"
            )));
        }
        Ok(ThinningStrategy::Retention(policy))
    }
}

impl fmt::Display for ThinningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThinningStrategy::None => f.write_str("none"),
            ThinningStrategy::Latest(n) => write!(f, "L{n}"),
            ThinningStrategy::ThinOut {
                days,
                weeks,
                months,
            } => write!(f, "{days}D{weeks}W{months}M"),
            ThinningStrategy::Retention(p) => {
                let mut rules = Vec::new();
                if let Some(d) = &p.keep_within {
                    rules.push(format!("keep-within-{}", format_duration(d)));
                }
                let counted = [
                    ("last", p.keep_last),
                    ("hourly", p.keep_hourly),
                    ("daily", p.keep_daily),
                    ("weekly", p.keep_weekly),
                    ("monthly", p.keep_monthly),
                    ("yearly", p.keep_yearly),
                ];
                for (name, n) in counted {
                    if let Some(n) = n {
                        rules.push(format!("keep-{name}-{n}"));
                    }
                }
                f.write_str(&rules.join(","))
            }
        }
    }
}

/// Retained indices with the reasons for keeping them.
#[derive(Default)]
struct Keep {
    kept: HashSet<usize>,
    reasons: HashMap<usize, Vec<String>>,
}

impl Keep {
    fn keep(&mut self, idx: usize, reason: String) {
        self.kept.insert(idx);
        self.reasons.entry(idx).or_default().push(reason);
    }
}

type HourlyKey = (i32, u32, u32);
type DailyKey = (i32, u32);
type WeeklyKey = (i32, u32);
type MonthlyKey = (i32, u32);
type YearlyKey = (i32,);

fn hourly_key(t: &DateTime<Utc>) -> HourlyKey {
    (t.year(), t.ordinal(), t.hour())
}

fn daily_key(t: &DateTime<Utc>) -> DailyKey {
    (t.year(), t.ordinal())
}

fn weekly_key(t: &DateTime<Utc>) -> WeeklyKey {
    let iw: IsoWeek = t.iso_week();
    (iw.year(), iw.week())
}

fn monthly_key(t: &DateTime<Utc>) -> MonthlyKey {
    (t.year(), t.month())
}

fn yearly_key(t: &DateTime<Utc>) -> YearlyKey {
    (t.year(),)
}

/// For each new bucket encountered (up to `max_buckets`), keep the first,
/// i.e. newest, archive in it. Every new bucket consumes a slot, even when
/// its archive was already kept by an earlier rule.
fn apply_bucket_rule<K: Eq + std::hash::Hash>(
    indices: &[usize],
    times: &[DateTime<Utc>],
    keep: &mut Keep,
    max_buckets: usize,
    key_fn: impl Fn(&DateTime<Utc>) -> K,
    rule_name: &str,
) {
    let mut seen_buckets: HashSet<K> = HashSet::new();
    let mut kept_count = 0usize;

    for &idx in indices {
        if kept_count >= max_buckets {
            break;
        }
        if !seen_buckets.insert(key_fn(&times[idx])) {
            continue;
        }
        keep.keep(idx, format!("{rule_name} #{}", kept_count + 1));
        kept_count += 1;
    }
}

fn apply_retention(
    policy: &RetentionPolicy,
    indices: &[usize],
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
    keep: &mut Keep,
) {
    if let Some(within) = policy.keep_within {
        // A window reaching past the earliest representable time covers
        // everything.
        let cutoff = now.checked_sub_signed(within);
        for &idx in indices {
            if cutoff.is_none_or(|c| times[idx] >= c) {
                keep.keep(idx, "within".into());
            }
        }
    }

    if let Some(n) = policy.keep_last {
        for (i, &idx) in indices.iter().take(n).enumerate() {
            keep.keep(idx, format!("last #{}", i + 1));
        }
    }

    if let Some(n) = policy.keep_hourly {
        apply_bucket_rule(indices, times, keep, n, hourly_key, "hourly");
    }
    if let Some(n) = policy.keep_daily {
        apply_bucket_rule(indices, times, keep, n, daily_key, "daily");
    }
    if let Some(n) = policy.keep_weekly {
        apply_bucket_rule(indices, times, keep, n, weekly_key, "weekly");
    }
    if let Some(n) = policy.keep_monthly {
        apply_bucket_rule(indices, times, keep, n, monthly_key, "monthly");
    }
    if let Some(n) = policy.keep_yearly {
        apply_bucket_rule(indices, times, keep, n, yearly_key, "yearly");
    }
}

fn days_before(date: NaiveDate, n: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(n)).unwrap_or(NaiveDate::MIN)
}

fn months_before(date: NaiveDate, n: u32) -> NaiveDate {
    date.checked_sub_months(Months::new(n))
        .unwrap_or(NaiveDate::MIN)
}

fn apply_thin_out(
    (days, weeks, months): (u32, u32, u32),
    indices: &[usize],
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
    keep: &mut Keep,
) {
    let Some((&newest, rest)) = indices.split_first() else {
        return;
    };
    keep.keep(newest, "newest".into());

    let fix = now.date_naive();
    let date_of = |idx: usize| times[idx].date_naive();
    let Some(oldest_date) = rest.last().map(|&idx| date_of(idx)) else {
        return;
    };
    // Oldest archive (other than the newest) dated within [start, end).
    let oldest_in = |start: NaiveDate, end: NaiveDate| {
        rest.iter().rev().copied().find(|&idx| {
            let d = date_of(idx);
            d >= start && d < end
        })
    };

    for &idx in rest {
        if date_of(idx) >= fix {
            keep.keep(idx, "today".into());
        }
    }

    // Windows step backwards in time; once one ends at or before the oldest
    // archive, every later window is empty.
    for d in 0..days {
        let end = days_before(fix, u64::from(d));
        if end <= oldest_date {
            break;
        }
        if let Some(idx) = oldest_in(days_before(end, 1), end) {
            keep.keep(idx, format!("day #{}", d + 1));
        }
    }

    let days_end = days_before(fix, u64::from(days));
    for w in 0..weeks {
        let end = days_before(days_end, 7 * u64::from(w));
        if end <= oldest_date {
            break;
        }
        if let Some(idx) = oldest_in(days_before(end, 7), end) {
            keep.keep(idx, format!("week #{}", w + 1));
        }
    }

    let weeks_end = days_before(days_end, 7 * u64::from(weeks));
    let fix_month = weeks_end.with_day(1).unwrap_or(weeks_end);
    for &idx in rest {
        let d = date_of(idx);
        if d >= fix_month && d < weeks_end {
            keep.keep(idx, "partial month".into());
        }
    }

    for m in 0..months {
        let end = months_before(fix_month, m);
        if end <= oldest_date {
            break;
        }
        if let Some(idx) = oldest_in(months_before(fix_month, m + 1), end) {
            keep.keep(idx, format!("month #{}", m + 1));
        }
    }

    let mut year_end = months_before(fix_month, months);
    let mut n = 1;
    while oldest_date < year_end {
        let start = months_before(year_end, 12);
        if let Some(idx) = oldest_in(start, year_end) {
            keep.keep(idx, format!("year #{n}"));
        }
        year_end = start;
        n += 1;
    }
}

impl ThinningStrategy {
    /// Split `refs` into archives to retain and to remove.
    ///
    /// Pure and deterministic: the input order does not matter (archives are
    /// ordered by timestamp, then name, newest first), and a non-empty input
    /// always retains at least its newest archive.
    pub fn select(&self, refs: &[StoredArchiveRef], now: DateTime<Utc>) -> ThinningDecision {
        if refs.is_empty() {
            return ThinningDecision::default();
        }

        let mut indices: Vec<usize> = (0..refs.len()).collect();
        indices.sort_by(|&a, &b| {
            refs[b]
                .created
                .cmp(&refs[a].created)
                .then_with(|| refs[b].key.cmp(&refs[a].key))
        });
        let times: Vec<DateTime<Utc>> = refs.iter().map(|r| r.created).collect();

        let mut keep = Keep::default();
        match self {
            ThinningStrategy::None => {
                for &idx in &indices {
                    keep.keep(idx, "no thinning".into());
                }
            }
            ThinningStrategy::Latest(n) => {
                for (i, &idx) in indices.iter().take(*n).enumerate() {
                    keep.keep(idx, format!("latest #{}", i + 1));
                }
            }
            ThinningStrategy::ThinOut {
                days,
                weeks,
                months,
            } => apply_thin_out((*days, *weeks, *months), &indices, &times, now, &mut keep),
            ThinningStrategy::Retention(policy) => {
                apply_retention(policy, &indices, &times, now, &mut keep)
            }
        }

        if keep.kept.is_empty() {
            tracing::warn!("thinning policy '{self}' matches no archive; keeping the newest");
            keep.keep(indices[0], "newest".into());
        }

        let mut decision = ThinningDecision::default();
        for &idx in &indices {
            let stored = refs[idx].clone();
            match keep.reasons.remove(&idx) {
                Some(reasons) => {
                    decision.reasons.insert(stored.key.clone(), reasons);
                    decision.retain.push(stored);
                }
                None => decision.remove.push(stored),
            }
        }
        decision
    }
}

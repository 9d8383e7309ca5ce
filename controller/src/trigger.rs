//! Trigger engine: polls configured triggers on a fixed period and submits a
//! `PipelineReq` to the run engine for each one that fires (spec.md §4.10).
//!
//! Grounded on `examples/original_source/tubular/trigger.py` (the shared base
//! `CommitTrigger`/schedule logic both trigger kinds here extend).

use crate::run_engine::{submit, ArgKv, PipelineReq};
use crate::state::ControllerState;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tubular_core::git;

pub const TRIGGER_UPDATE_PERIOD: Duration = Duration::from_secs(30);

/// One pipeline request a firing trigger should enqueue.
#[derive(Debug, Clone)]
pub struct PipelineReqTemplate {
    pub branch: String,
    pub pipeline_path: String,
    pub args: Vec<ArgKv>,
}

pub struct CommitTrigger {
    pub name: String,
    pub repo_url: String,
    pub repo_branch: String,
    pub globs: Vec<String>,
    pub requests: Vec<PipelineReqTemplate>,
    cur_commit: std::sync::Mutex<Option<String>>,
    scratch_dir: PathBuf,
}

impl CommitTrigger {
    pub fn new(
        name: String,
        repo_url: String,
        repo_branch: String,
        globs: Vec<String>,
        requests: Vec<PipelineReqTemplate>,
        workspace: &std::path::Path,
    ) -> Self {
        let initial = git::remote_head(&repo_url, &repo_branch).ok();
        Self {
            scratch_dir: workspace.join(format!("trigger_{name}")),
            name,
            repo_url,
            repo_branch,
            globs,
            requests,
            cur_commit: std::sync::Mutex::new(initial),
        }
    }

    /// Returns true if this trigger should fire, updating `cur_commit` as a side
    /// effect (spec.md §4.10 "CommitTrigger").
    pub fn check(&self) -> bool {
        let Ok(remote) = git::remote_head(&self.repo_url, &self.repo_branch) else {
            warn!(trigger = %self.name, "could not reach remote head for commit trigger");
            return false;
        };

        let mut cur = self.cur_commit.lock().expect("commit trigger lock poisoned");
        if cur.as_deref() == Some(remote.as_str()) {
            return false;
        }

        if self.globs.is_empty() {
            *cur = Some(remote);
            return true;
        }

        let previous = cur.clone();
        *cur = Some(remote.clone());

        let Some(previous) = previous else {
            return true;
        };

        let changed = self.changed_files(&previous, &remote);
        let patterns: Vec<Regex> = self
            .globs
            .iter()
            .filter_map(|g| Regex::new(&glob_to_regex(g)).ok())
            .collect();

        changed.iter().any(|file| patterns.iter().any(|p| p.is_match(file)))
    }

    fn changed_files(&self, sha_a: &str, sha_b: &str) -> Vec<String> {
        let repo = git::Repo::new(self.repo_url.clone(), self.repo_branch.clone(), self.scratch_dir.clone());
        if !self.scratch_dir.join(".git").is_dir() {
            if let Err(e) = git::clone_empty(&repo) {
                warn!(trigger = %self.name, error = %e, "could not prepare scratch clone for diff");
                return Vec::new();
            }
        }
        git::changed_files(&repo, sha_a, sha_b).unwrap_or_default()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodUnit {
    Minute,
    Hour,
    Day,
    Week,
}

pub struct ScheduleTrigger {
    pub name: String,
    pub requests: Vec<PipelineReqTemplate>,
    unit: PeriodUnit,
    count: i64,
    time_of_day: Option<(u32, u32)>,
    day_of_week: Option<chrono::Weekday>,
    next_run: std::sync::Mutex<chrono::DateTime<chrono::Local>>,
}

impl ScheduleTrigger {
    /// Parses `period` (`"<N> <unit>"`) and, for `day`/`week` units, a `when`
    /// string of the shape `[DayOfWeek] H[:MM](am|pm)` (spec.md §4.10
    /// "ScheduleTrigger").
    pub fn new(name: String, period: &str, when: Option<&str>, requests: Vec<PipelineReqTemplate>) -> anyhow::Result<Self> {
        let mut parts = period.split_whitespace();
        let count: i64 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("schedule trigger '{name}' has an empty period"))?
            .parse()?;
        let unit = match parts.next().unwrap_or("").to_ascii_lowercase().as_str() {
            "min" | "minute" | "minutes" => PeriodUnit::Minute,
            "hour" | "hours" => PeriodUnit::Hour,
            "day" | "days" => PeriodUnit::Day,
            "week" | "weeks" => PeriodUnit::Week,
            other => anyhow::bail!("schedule trigger '{name}' has unknown period unit '{other}'"),
        };

        let (time_of_day, day_of_week) = match unit {
            PeriodUnit::Day | PeriodUnit::Week => {
                let when = when.ok_or_else(|| anyhow::anyhow!("schedule trigger '{name}' needs a 'when' for day/week periods"))?;
                parse_when(when)?
            }
            PeriodUnit::Minute | PeriodUnit::Hour => (None, None),
        };

        let next_run = compute_initial_next_run(unit, count, time_of_day, day_of_week);

        Ok(Self {
            name,
            requests,
            unit,
            count,
            time_of_day,
            day_of_week,
            next_run: std::sync::Mutex::new(next_run),
        })
    }

    pub fn check(&self) -> bool {
        let now = chrono::Local::now();
        let mut next_run = self.next_run.lock().expect("schedule trigger lock poisoned");
        if now < *next_run {
            return false;
        }
        let offset = period_duration(self.unit, self.count, self.time_of_day, self.day_of_week);
        *next_run += offset;
        true
    }
}

fn parse_when(when: &str) -> anyhow::Result<(Option<(u32, u32)>, Option<chrono::Weekday>)> {
    use chrono::Weekday;
    let parts: Vec<&str> = when.split_whitespace().collect();
    let (day, time_part) = if parts.len() == 2 {
        (Some(parts[0]), parts[1])
    } else {
        (None, parts.first().copied().unwrap_or(when))
    };

    let day_of_week = day
        .map(|d| match d.to_ascii_lowercase().as_str() {
            "monday" | "mon" => Ok(Weekday::Mon),
            "tuesday" | "tue" => Ok(Weekday::Tue),
            "wednesday" | "wed" => Ok(Weekday::Wed),
            "thursday" | "thu" => Ok(Weekday::Thu),
            "friday" | "fri" => Ok(Weekday::Fri),
            "saturday" | "sat" => Ok(Weekday::Sat),
            "sunday" | "sun" => Ok(Weekday::Sun),
            other => anyhow::bail!("unknown day of week '{other}'"),
        })
        .transpose()?;

    let lower = time_part.to_ascii_lowercase();
    let (digits, is_pm) = if let Some(stripped) = lower.strip_suffix("am") {
        (stripped, Some(false))
    } else if let Some(stripped) = lower.strip_suffix("pm") {
        (stripped, Some(true))
    } else {
        (lower.as_str(), None)
    };

    let (hour_str, minute_str) = digits.split_once(':').unwrap_or((digits, "0"));
    let mut hour: u32 = hour_str.trim().parse()?;
    let minute: u32 = minute_str.trim().parse()?;

    // 12am = hour 0, 12pm = hour 12 (spec.md §4.10 "Ambiguities").
    match is_pm {
        Some(true) if hour != 12 => hour += 12,
        Some(true) => {}
        Some(false) if hour == 12 => hour = 0,
        _ => {}
    }

    Ok((Some((hour, minute)), day_of_week))
}

fn period_duration(
    unit: PeriodUnit,
    count: i64,
    _time_of_day: Option<(u32, u32)>,
    _day_of_week: Option<chrono::Weekday>,
) -> chrono::Duration {
    match unit {
        PeriodUnit::Minute => chrono::Duration::minutes(count),
        PeriodUnit::Hour => chrono::Duration::hours(count),
        PeriodUnit::Day => chrono::Duration::days(count),
        PeriodUnit::Week => chrono::Duration::weeks(count),
    }
}

fn compute_initial_next_run(
    unit: PeriodUnit,
    count: i64,
    time_of_day: Option<(u32, u32)>,
    day_of_week: Option<chrono::Weekday>,
) -> chrono::DateTime<chrono::Local> {
    use chrono::{Datelike, Local, NaiveTime, TimeZone, Timelike};

    let now = Local::now();

    match unit {
        PeriodUnit::Minute | PeriodUnit::Hour => now + period_duration(unit, count, None, None),
        PeriodUnit::Day => {
            let (hour, minute) = time_of_day.unwrap_or((0, 0));
            let today_at = now
                .date_naive()
                .and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default());
            let today_at = Local.from_local_datetime(&today_at).single().unwrap_or(now);
            if today_at > now {
                today_at
            } else {
                today_at + chrono::Duration::days(1)
            }
        }
        PeriodUnit::Week => {
            let (hour, minute) = time_of_day.unwrap_or((0, 0));
            let target_day = day_of_week.unwrap_or_else(|| now.weekday());
            let mut candidate_date = now.date_naive();
            loop {
                let at = candidate_date.and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default());
                let at = Local.from_local_datetime(&at).single().unwrap_or(now);
                if candidate_date.weekday() == target_day && at > now {
                    return at;
                }
                candidate_date = candidate_date.succ_opt().unwrap_or(candidate_date);
                if candidate_date > now.date_naive() + chrono::Duration::days(8) {
                    return now + chrono::Duration::weeks(1);
                }
            }
        }
    }
}

pub enum Trigger {
    Commit(CommitTrigger),
    Schedule(ScheduleTrigger),
}

impl Trigger {
    fn check(&self) -> bool {
        match self {
            Trigger::Commit(t) => t.check(),
            Trigger::Schedule(t) => t.check(),
        }
    }

    fn requests(&self) -> &[PipelineReqTemplate] {
        match self {
            Trigger::Commit(t) => &t.requests,
            Trigger::Schedule(t) => &t.requests,
        }
    }

    fn name(&self) -> &str {
        match self {
            Trigger::Commit(t) => &t.name,
            Trigger::Schedule(t) => &t.name,
        }
    }
}

/// The dedicated trigger thread's loop: poll every trigger under the trigger
/// lock, submit pipeline requests for each firing trigger, then clean up any
/// `trigger_*` scratch directories (spec.md §4.10). Also checks the config repo
/// for updates each iteration, since spec.md §4.11 names no separate period for
/// `loadConfigs()` and this thread already wakes on a fixed cadence.
pub fn run_loop(
    state: Arc<ControllerState>,
    should_run: Arc<std::sync::atomic::AtomicBool>,
    config_repo: Option<(String, String)>,
) {
    use std::sync::atomic::Ordering;

    while should_run.load(Ordering::SeqCst) {
        if let Some((url, branch)) = &config_repo {
            match crate::config_reload::reload(&state, url, branch) {
                Ok(true) => info!("picked up new config repo revision"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "config reload failed, keeping prior snapshot"),
            }
        }

        {
            let _guard = state.trigger_lock.lock().expect("trigger lock poisoned");
            let triggers = state.triggers.read().expect("trigger list poisoned");
            for trigger in triggers.iter() {
                if trigger.check() {
                    info!(trigger = trigger.name(), "trigger fired");
                    for req in trigger.requests() {
                        submit(
                            Arc::clone(&state),
                            PipelineReq {
                                branch: req.branch.clone(),
                                pipeline_path: req.pipeline_path.clone(),
                                args: req.args.clone(),
                            },
                        );
                    }
                } else {
                    debug!(trigger = trigger.name(), "trigger did not fire");
                }
            }
        }

        if let Err(e) = cleanup_scratch_dirs(&state.workspace) {
            error!(error = %e, "failed to clean up trigger scratch directories");
        }

        std::thread::sleep(TRIGGER_UPDATE_PERIOD);
    }
}

fn cleanup_scratch_dirs(workspace: &std::path::Path) -> std::io::Result<()> {
    if !workspace.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(workspace)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("trigger_") {
            let _ = std::fs::remove_dir_all(entry.path());
        }
    }
    Ok(())
}

//! Trigger domain types: scheduled intents to run a job.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JobKey, Priority};

/// Identity of a trigger. Triggers created by the scheduler share the name
/// and group of the job they fire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn for_job(job: &JobKey) -> Self {
        Self::new(job.name.clone(), job.group.clone())
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Errors building or advancing a trigger.
#[derive(Debug, Error, PartialEq)]
pub enum TriggerError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("Interval must be positive")]
    InvalidInterval,
    #[error("Unknown trigger state: {0}")]
    UnknownState(String),
}

/// Lifecycle of a trigger in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its fire time (or for a filter/capacity deferral to pass).
    #[default]
    Waiting,
    /// Claimed by a dispatch tick, not yet handed to a worker.
    Acquired,
    /// A worker is running the job.
    Executing,
    /// No further fire times.
    Complete,
    /// Fired later than the misfire threshold.
    Misfired,
    /// Excluded from acquisition until resumed.
    Paused,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Complete => "complete",
            TriggerState::Misfired => "misfired",
            TriggerState::Paused => "paused",
        }
    }
}

impl FromStr for TriggerState {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "executing" => Ok(TriggerState::Executing),
            "complete" => Ok(TriggerState::Complete),
            "misfired" => Ok(TriggerState::Misfired),
            "paused" => Ok(TriggerState::Paused),
            other => Err(TriggerError::UnknownState(other.to_string())),
        }
    }
}

/// Unit for calendar-based intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(IntervalUnit::Day),
            "week" => Some(IntervalUnit::Week),
            "month" => Some(IntervalUnit::Month),
            _ => None,
        }
    }
}

/// Which table family a schedule is persisted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Simple,
    Cron,
    CalendarInterval,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Simple => "SIMPLE",
            ScheduleKind::Cron => "CRON",
            ScheduleKind::CalendarInterval => "CAL_INT",
        }
    }
}

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once, as soon as possible.
    Now,
    /// Fire every `interval_ms`. `repeat_count` is the number of repeats
    /// after the first fire; `None` repeats forever.
    Interval {
        interval_ms: i64,
        repeat_count: Option<u32>,
    },
    /// Six or seven field cron expression (seconds first), evaluated in UTC.
    Cron { expression: String },
    /// Fire every `every` calendar units, aligned to the start time.
    CalendarInterval { unit: IntervalUnit, every: u32 },
}

impl Schedule {
    pub fn every_minutes(minutes: i64) -> Self {
        Schedule::Interval {
            interval_ms: minutes * 60_000,
            repeat_count: None,
        }
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Now | Schedule::Interval { .. } => ScheduleKind::Simple,
            Schedule::Cron { .. } => ScheduleKind::Cron,
            Schedule::CalendarInterval { .. } => ScheduleKind::CalendarInterval,
        }
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        match self {
            Schedule::Now => Ok(()),
            Schedule::Interval { interval_ms, .. } if *interval_ms <= 0 => {
                Err(TriggerError::InvalidInterval)
            }
            Schedule::Interval { .. } => Ok(()),
            Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
            Schedule::CalendarInterval { every: 0, .. } => Err(TriggerError::InvalidInterval),
            Schedule::CalendarInterval { .. } => Ok(()),
        }
    }

    /// First fire time for a trigger starting at `start`.
    pub fn first_fire(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { expression } => {
                let schedule = parse_cron(expression).ok()?;
                schedule.after(&(start - Duration::milliseconds(1))).next()
            }
            _ => Some(start),
        }
    }

    /// Next fire time strictly after `fired_at`.
    ///
    /// Missed fire times are never replayed: a trigger that fired late jumps
    /// to the first slot after the actual fire.
    pub fn next_after(
        &self,
        start: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        times_triggered: u32,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Now => None,
            Schedule::Interval {
                interval_ms,
                repeat_count,
            } => {
                if repeat_count.is_some_and(|n| times_triggered > n) || *interval_ms <= 0 {
                    return None;
                }
                let elapsed = (fired_at - start).num_milliseconds().max(0);
                let steps = elapsed / interval_ms + 1;
                Some(start + Duration::milliseconds(steps * interval_ms))
            }
            Schedule::Cron { expression } => {
                let schedule = parse_cron(expression).ok()?;
                schedule.after(&fired_at).next()
            }
            Schedule::CalendarInterval { unit, every } => {
                let mut next = start;
                while next <= fired_at {
                    next = step_calendar(next, *unit, *every)?;
                }
                Some(next)
            }
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, TriggerError> {
    cron::Schedule::from_str(expression).map_err(|e| TriggerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn step_calendar(from: DateTime<Utc>, unit: IntervalUnit, every: u32) -> Option<DateTime<Utc>> {
    if every == 0 {
        return None;
    }
    match unit {
        IntervalUnit::Day => from.checked_add_signed(Duration::days(every as i64)),
        IntervalUnit::Week => from.checked_add_signed(Duration::weeks(every as i64)),
        IntervalUnit::Month => from.checked_add_months(Months::new(every)),
    }
}

/// A scheduled intent to run a job at or after a given time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub schedule: Schedule,
    pub priority: Priority,
    pub state: TriggerState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_triggered: u32,
}

impl Trigger {
    /// Create a trigger for `job_key` that starts now.
    pub fn new(job_key: &JobKey, schedule: Schedule) -> Self {
        let start = Utc::now();
        Self {
            key: TriggerKey::for_job(job_key),
            job_key: job_key.clone(),
            next_fire_time: schedule.first_fire(start),
            schedule,
            priority: Priority::default(),
            state: TriggerState::Waiting,
            start_time: start,
            end_time: None,
            previous_fire_time: None,
            times_triggered: 0,
        }
    }

    /// Fire once, now.
    pub fn now(job_key: &JobKey) -> Self {
        Self::new(job_key, Schedule::Now)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = key;
        self
    }

    /// Move the start time, recomputing the first fire time.
    pub fn start_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.next_fire_time = self.schedule.first_fire(start);
        self
    }

    pub fn end_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Point a copy of this trigger at another job, keeping the schedule.
    pub fn for_job(&self, job_key: &JobKey) -> Self {
        Self {
            key: TriggerKey::for_job(job_key),
            job_key: job_key.clone(),
            ..self.clone()
        }
    }

    /// Whether this trigger is due later than `threshold` past its fire time.
    pub fn is_misfired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.next_fire_time
            .is_some_and(|next| now - next > threshold)
    }

    /// Record a fire at `fired_at` and compute the next fire time.
    ///
    /// Returns `false` once the trigger has no further fire times.
    pub fn advance(&mut self, fired_at: DateTime<Utc>) -> bool {
        self.previous_fire_time = Some(fired_at);
        self.times_triggered = self.times_triggered.saturating_add(1);

        let next = self
            .schedule
            .next_after(self.start_time, fired_at, self.times_triggered)
            .filter(|next| self.end_time.is_none_or(|end| *next <= end));

        self.next_fire_time = next;
        self.state = if next.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        next.is_some()
    }
}

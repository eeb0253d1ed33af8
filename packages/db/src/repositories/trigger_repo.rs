//! Trigger repository.
//!
//! Common trigger columns live in `job_trigger`; schedule-specific columns
//! live in one table per schedule kind, keyed by `trigger_id`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sched_core::{
    IntervalUnit, JobKey, Priority, Schedule, ScheduleKind, Trigger, TriggerKey, TriggerState,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{from_millis, to_millis};
use crate::{Database, DbError};

/// Repository for trigger persistence operations.
pub struct TriggerRepository;

/// A trigger together with its storage identity.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrigger {
    pub id: String,
    /// Insertion order, used as the final ordering tie-break.
    pub seq: i64,
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TriggerRecord {
    trigger_id: String,
    trigger_name: String,
    trigger_group: String,
    job_name: String,
    job_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_fire_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_fire_time: Option<i64>,
    priority: i64,
    trigger_state: String,
    trigger_type: String,
    start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<i64>,
    #[serde(default)]
    misfire_instr: i64,
    #[serde(default)]
    times_triggered: i64,
    seq: i64,
    /// Set when a filter or capacity check pushed the fire time back.
    #[serde(default)]
    deferred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimpleTriggerRecord {
    trigger_id: String,
    /// `-1` repeats forever.
    repeat_count: i64,
    /// `0` fires once, now.
    repeat_interval: i64,
    #[serde(default)]
    times_triggered: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CronTriggerRecord {
    trigger_id: String,
    cron_expression: String,
    time_zone_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimpropTriggerRecord {
    trigger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    str_prop_1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    int_prop_1: Option<i64>,
    time_zone_id: String,
}

#[derive(Debug, Deserialize)]
struct TriggerIdRecord {
    trigger_id: String,
}

/// Misfire instruction code stored with every trigger: fire once now.
const MISFIRE_FIRE_ONCE_NOW: i64 = 1;

fn kind_table(kind: ScheduleKind) -> &'static str {
    match kind {
        ScheduleKind::Simple => "simple_trigger",
        ScheduleKind::Cron => "cron_trigger",
        ScheduleKind::CalendarInterval => "simprop_trigger",
    }
}

fn schedule_record(id: &str, trigger: &Trigger) -> Result<serde_json::Value, DbError> {
    let trigger_id = id.to_string();
    let value = match &trigger.schedule {
        Schedule::Now => serde_json::to_value(SimpleTriggerRecord {
            trigger_id,
            repeat_count: 0,
            repeat_interval: 0,
            times_triggered: trigger.times_triggered as i64,
        })?,
        Schedule::Interval {
            interval_ms,
            repeat_count,
        } => serde_json::to_value(SimpleTriggerRecord {
            trigger_id,
            repeat_count: repeat_count.map_or(-1, i64::from),
            repeat_interval: *interval_ms,
            times_triggered: trigger.times_triggered as i64,
        })?,
        Schedule::Cron { expression } => serde_json::to_value(CronTriggerRecord {
            trigger_id,
            cron_expression: expression.clone(),
            time_zone_id: "UTC".to_string(),
        })?,
        Schedule::CalendarInterval { unit, every } => serde_json::to_value(SimpropTriggerRecord {
            trigger_id,
            str_prop_1: Some(unit.as_str().to_string()),
            int_prop_1: Some(i64::from(*every)),
            time_zone_id: "UTC".to_string(),
        })?,
    };
    Ok(value)
}

impl TriggerRecord {
    fn from_trigger(id: &str, seq: i64, trigger: &Trigger) -> Self {
        Self {
            trigger_id: id.to_string(),
            trigger_name: trigger.key.name.clone(),
            trigger_group: trigger.key.group.clone(),
            job_name: trigger.job_key.name.clone(),
            job_group: trigger.job_key.group.clone(),
            next_fire_time: trigger.next_fire_time.map(to_millis),
            prev_fire_time: trigger.previous_fire_time.map(to_millis),
            priority: i64::from(trigger.priority.0),
            trigger_state: trigger.state.as_str().to_string(),
            trigger_type: trigger.schedule.kind().as_str().to_string(),
            start_time: to_millis(trigger.start_time),
            end_time: trigger.end_time.map(to_millis),
            misfire_instr: MISFIRE_FIRE_ONCE_NOW,
            times_triggered: trigger.times_triggered as i64,
            seq,
            deferred: false,
        }
    }

    fn into_stored(self, schedule: Schedule) -> Result<StoredTrigger, DbError> {
        let state = self.trigger_state.parse::<TriggerState>()?;
        Ok(StoredTrigger {
            id: self.trigger_id,
            seq: self.seq,
            trigger: Trigger {
                key: TriggerKey::new(self.trigger_name, self.trigger_group),
                job_key: JobKey::new(self.job_name, self.job_group),
                schedule,
                priority: Priority(self.priority as i32),
                state,
                start_time: from_millis(self.start_time),
                end_time: self.end_time.map(from_millis),
                next_fire_time: self.next_fire_time.map(from_millis),
                previous_fire_time: self.prev_fire_time.map(from_millis),
                times_triggered: self.times_triggered.max(0) as u32,
            },
        })
    }
}

fn simple_schedule(record: &SimpleTriggerRecord) -> Schedule {
    if record.repeat_interval <= 0 {
        Schedule::Now
    } else {
        Schedule::Interval {
            interval_ms: record.repeat_interval,
            repeat_count: u32::try_from(record.repeat_count).ok(),
        }
    }
}

fn calendar_schedule(record: &SimpropTriggerRecord) -> Result<Schedule, DbError> {
    let unit = record
        .str_prop_1
        .as_deref()
        .and_then(IntervalUnit::parse)
        .ok_or_else(|| {
            DbError::Serialization(format!(
                "invalid interval unit for trigger {}",
                record.trigger_id
            ))
        })?;
    let every = record
        .int_prop_1
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            DbError::Serialization(format!(
                "invalid interval length for trigger {}",
                record.trigger_id
            ))
        })?;
    Ok(Schedule::CalendarInterval { unit, every })
}

impl TriggerRepository {
    /// Insert a trigger and its schedule row in one transaction.
    pub async fn insert(db: &Database, trigger: &Trigger, seq: i64) -> Result<StoredTrigger, DbError> {
        let id = Ulid::new().to_string();
        let record = TriggerRecord::from_trigger(&id, seq, trigger);
        let schedule = schedule_record(&id, trigger)?;

        db.query(
            r#"
            BEGIN TRANSACTION;
            CREATE type::thing('job_trigger', $id) CONTENT $record;
            CREATE type::thing($kind_table, $id) CONTENT $schedule;
            COMMIT TRANSACTION;
            "#,
        )
        .bind(("id", id.clone()))
        .bind(("record", record))
        .bind(("kind_table", kind_table(trigger.schedule.kind())))
        .bind(("schedule", schedule))
        .await?
        .check()?;

        Ok(StoredTrigger {
            id,
            seq,
            trigger: trigger.clone(),
        })
    }

    /// Get a trigger by storage id.
    pub async fn get(db: &Database, id: &str) -> Result<Option<StoredTrigger>, DbError> {
        let mut result = db
            .query("SELECT * FROM type::thing('job_trigger', $id)")
            .bind(("id", id.to_string()))
            .await?;

        let records: Vec<TriggerRecord> = result.take(0)?;
        Ok(Self::hydrate(db, records).await?.into_iter().next())
    }

    /// All triggers of a job.
    pub async fn for_job(db: &Database, key: &JobKey) -> Result<Vec<StoredTrigger>, DbError> {
        let mut result = db
            .query("SELECT * FROM job_trigger WHERE job_group = $group AND job_name = $name ORDER BY seq ASC")
            .bind(("group", key.group.clone()))
            .bind(("name", key.name.clone()))
            .await?;

        let records: Vec<TriggerRecord> = result.take(0)?;
        Self::hydrate(db, records).await
    }

    /// Waiting triggers due no later than `no_later_than`, in dispatch order.
    pub async fn ready(
        db: &Database,
        no_later_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredTrigger>, DbError> {
        let mut result = db
            .query(
                r#"
                SELECT * FROM job_trigger
                WHERE trigger_state = "waiting"
                    AND next_fire_time != NONE
                    AND next_fire_time <= $no_later_than
                ORDER BY priority DESC, next_fire_time ASC, seq ASC
                LIMIT $limit
                "#,
            )
            .bind(("no_later_than", to_millis(no_later_than)))
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<TriggerRecord> = result.take(0)?;
        Self::hydrate(db, records).await
    }

    /// All triggers in a state.
    pub async fn in_state(db: &Database, state: TriggerState) -> Result<Vec<StoredTrigger>, DbError> {
        let mut result = db
            .query("SELECT * FROM job_trigger WHERE trigger_state = $state ORDER BY seq ASC")
            .bind(("state", state.as_str()))
            .await?;

        let records: Vec<TriggerRecord> = result.take(0)?;
        Self::hydrate(db, records).await
    }

    /// Count triggers still owed a run: waiting or acquired ones that are
    /// due, plus any that were deferred to a later fire time.
    pub async fn count_waiting(db: &Database, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut result = db
            .query(
                r#"
                SELECT count() AS count FROM job_trigger
                WHERE (trigger_state = "waiting" OR trigger_state = "acquired")
                    AND (
                        (next_fire_time != NONE AND next_fire_time <= $now)
                        OR deferred = true
                    )
                GROUP ALL
                "#,
            )
            .bind(("now", to_millis(now)))
            .await?;

        #[derive(Deserialize)]
        struct Count {
            count: i64,
        }

        let counts: Vec<Count> = result.take(0)?;
        Ok(counts.first().map(|c| c.count.max(0) as u64).unwrap_or(0))
    }

    /// Move a trigger from `from` to `to`. Returns `false` when the trigger
    /// no longer exists or is in another state.
    pub async fn transition(
        db: &Database,
        id: &str,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool, DbError> {
        let mut result = db
            .query(
                "UPDATE type::thing('job_trigger', $id) SET trigger_state = $to WHERE trigger_state = $from RETURN trigger_id",
            )
            .bind(("id", id.to_string()))
            .bind(("from", from.as_str()))
            .bind(("to", to.as_str()))
            .await?;

        let updated: Vec<TriggerIdRecord> = result.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Return an acquired trigger to waiting, optionally moving its fire time.
    pub async fn release(
        db: &Database,
        id: &str,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        let query = if next_fire_time.is_some() {
            "UPDATE type::thing('job_trigger', $id) SET trigger_state = 'waiting', next_fire_time = $next, deferred = true WHERE trigger_state = 'acquired' RETURN trigger_id"
        } else {
            "UPDATE type::thing('job_trigger', $id) SET trigger_state = 'waiting' WHERE trigger_state = 'acquired' RETURN trigger_id"
        };

        let mut result = db
            .query(query)
            .bind(("id", id.to_string()))
            .bind(("next", next_fire_time.map(to_millis).unwrap_or_default()))
            .await?;

        let updated: Vec<TriggerIdRecord> = result.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Persist the fire bookkeeping of a trigger: state, fire times and count.
    pub async fn save_progress(db: &Database, stored: &StoredTrigger) -> Result<(), DbError> {
        let record = TriggerRecord::from_trigger(&stored.id, stored.seq, &stored.trigger);

        db.query(
            r#"
            BEGIN TRANSACTION;
            UPDATE type::thing('job_trigger', $id) CONTENT $record;
            UPDATE simple_trigger SET times_triggered = $times WHERE trigger_id = $id;
            COMMIT TRANSACTION;
            "#,
        )
        .bind(("id", stored.id.clone()))
        .bind(("record", record))
        .bind(("times", stored.trigger.times_triggered as i64))
        .await?
        .check()?;

        Ok(())
    }

    /// Set the state of every trigger of a job currently in `from`.
    pub async fn transition_for_job(
        db: &Database,
        key: &JobKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<usize, DbError> {
        let mut result = db
            .query(
                "UPDATE job_trigger SET trigger_state = $to WHERE job_group = $group AND job_name = $name AND trigger_state = $from RETURN trigger_id",
            )
            .bind(("group", key.group.clone()))
            .bind(("name", key.name.clone()))
            .bind(("from", from.as_str()))
            .bind(("to", to.as_str()))
            .await?;

        let updated: Vec<TriggerIdRecord> = result.take(0)?;
        Ok(updated.len())
    }

    /// Set the state of every trigger currently in `from`.
    pub async fn transition_all(
        db: &Database,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<usize, DbError> {
        let mut result = db
            .query("UPDATE job_trigger SET trigger_state = $to WHERE trigger_state = $from RETURN trigger_id")
            .bind(("from", from.as_str()))
            .bind(("to", to.as_str()))
            .await?;

        let updated: Vec<TriggerIdRecord> = result.take(0)?;
        Ok(updated.len())
    }

    /// Delete a trigger and its schedule row.
    pub async fn delete(db: &Database, id: &str) -> Result<(), DbError> {
        Self::delete_ids(db, vec![id.to_string()]).await
    }

    /// Delete every trigger of a job. Returns how many were removed.
    pub async fn delete_for_job(db: &Database, key: &JobKey) -> Result<usize, DbError> {
        let mut result = db
            .query("SELECT trigger_id FROM job_trigger WHERE job_group = $group AND job_name = $name")
            .bind(("group", key.group.clone()))
            .bind(("name", key.name.clone()))
            .await?;

        let ids: Vec<TriggerIdRecord> = result.take(0)?;
        let ids: Vec<String> = ids.into_iter().map(|r| r.trigger_id).collect();
        let count = ids.len();

        if count > 0 {
            Self::delete_ids(db, ids).await?;
        }
        Ok(count)
    }

    /// Delete every trigger and schedule row.
    pub async fn delete_all(db: &Database) -> Result<(), DbError> {
        db.query(
            r#"
            BEGIN TRANSACTION;
            DELETE simple_trigger;
            DELETE cron_trigger;
            DELETE simprop_trigger;
            DELETE job_trigger;
            COMMIT TRANSACTION;
            "#,
        )
        .await?
        .check()?;

        Ok(())
    }

    async fn delete_ids(db: &Database, ids: Vec<String>) -> Result<(), DbError> {
        db.query(
            r#"
            BEGIN TRANSACTION;
            DELETE simple_trigger WHERE trigger_id INSIDE $ids;
            DELETE cron_trigger WHERE trigger_id INSIDE $ids;
            DELETE simprop_trigger WHERE trigger_id INSIDE $ids;
            DELETE job_trigger WHERE trigger_id INSIDE $ids;
            COMMIT TRANSACTION;
            "#,
        )
        .bind(("ids", ids))
        .await?
        .check()?;

        Ok(())
    }

    /// Attach schedules to trigger rows, preserving row order.
    async fn hydrate(
        db: &Database,
        records: Vec<TriggerRecord>,
    ) -> Result<Vec<StoredTrigger>, DbError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = records.iter().map(|r| r.trigger_id.clone()).collect();
        let mut result = db
            .query(
                r#"
                SELECT * FROM simple_trigger WHERE trigger_id INSIDE $ids;
                SELECT * FROM cron_trigger WHERE trigger_id INSIDE $ids;
                SELECT * FROM simprop_trigger WHERE trigger_id INSIDE $ids;
                "#,
            )
            .bind(("ids", ids))
            .await?;

        let simple: Vec<SimpleTriggerRecord> = result.take(0)?;
        let cron: Vec<CronTriggerRecord> = result.take(1)?;
        let simprop: Vec<SimpropTriggerRecord> = result.take(2)?;

        let mut schedules: HashMap<String, Schedule> = HashMap::new();
        for record in simple {
            schedules.insert(record.trigger_id.clone(), simple_schedule(&record));
        }
        for record in cron {
            schedules.insert(
                record.trigger_id,
                Schedule::Cron {
                    expression: record.cron_expression,
                },
            );
        }
        for record in simprop {
            let schedule = calendar_schedule(&record)?;
            schedules.insert(record.trigger_id, schedule);
        }

        records
            .into_iter()
            .map(|record| {
                let schedule = schedules.remove(&record.trigger_id).ok_or_else(|| {
                    DbError::NotFound(format!(
                        "{} schedule for trigger {}",
                        record.trigger_type, record.trigger_id
                    ))
                })?;
                record.into_stored(schedule)
            })
            .collect()
    }
}

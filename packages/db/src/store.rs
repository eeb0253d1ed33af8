//! The trigger store: durable pending and recurring work.
//!
//! Every public operation runs under the [`RetryPolicy`] and takes the
//! matching side of the [`SchedulerLock`] inside each attempt, so a guard is
//! never held across a backoff sleep.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sched_core::{FiredId, JobDefinition, JobKey, Priority, Trigger, TriggerState};

use crate::repositories::{
    FiredTriggerRecord, FiredTriggerRepository, JobDetailRepository, LockRepository, NamedLock,
    SchedulerStateRepository, StoredTrigger, TriggerRepository,
};
use crate::{Database, DbError, RetryPolicy, SchedulerLock, StoreConfig, connect_db, init_schema};

/// Tunables for a [`TriggerStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Identifies this process in fired-trigger rows, heartbeats and locks.
    pub instance_name: String,
    pub retry: RetryPolicy,
    /// A trigger acquired later than this past its fire time is a misfire.
    pub misfire_threshold: Duration,
    /// Expected gap between heartbeats.
    pub checkin_interval: Duration,
    /// How long to wait for a named lock held by another instance.
    pub lock_timeout: Duration,
    /// A named lock held longer than this is considered abandoned.
    pub lock_stale_after: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            instance_name: "scheduler".to_string(),
            retry: RetryPolicy::default(),
            misfire_threshold: Duration::from_secs(60),
            checkin_interval: Duration::from_secs(15),
            lock_timeout: Duration::from_secs(5),
            lock_stale_after: Duration::from_secs(60),
        }
    }
}

impl StoreOptions {
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = threshold;
        self
    }

    pub fn with_checkin_interval(mut self, interval: Duration) -> Self {
        self.checkin_interval = interval;
        self
    }
}

/// A trigger claimed for dispatch, with the job it fires.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredTrigger {
    pub stored: StoredTrigger,
    pub job: JobDefinition,
    /// Acquired later than the misfire threshold; it still fires once.
    pub misfired: bool,
}

impl AcquiredTrigger {
    pub fn trigger(&self) -> &Trigger {
        &self.stored.trigger
    }

    pub fn job_key(&self) -> &JobKey {
        &self.job.key
    }
}

/// An execution handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTrigger {
    pub id: FiredId,
    pub stored: StoredTrigger,
    pub job: JobDefinition,
    pub fired_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

impl FiredTrigger {
    pub fn job_key(&self) -> &JobKey {
        &self.job.key
    }
}

/// How an execution ended, as far as the store is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Advance the trigger to its next fire time.
    Succeeded,
    /// With `retry_at`, fire the same slot again at that time; without it,
    /// advance as if it had succeeded.
    Failed { retry_at: Option<DateTime<Utc>> },
}

/// What [`TriggerStore::recover_after_restart`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Acquired triggers returned to waiting.
    pub released: usize,
    /// Interrupted executions of recoverable jobs, set to fire again now.
    pub recovered: usize,
    /// Interrupted executions advanced to their next fire time.
    pub advanced: usize,
    /// Interrupted executions with no further fire time, removed.
    pub dropped: usize,
}

/// Durable record of jobs and their triggers.
#[derive(Clone)]
pub struct TriggerStore {
    db: Database,
    lock: SchedulerLock,
    options: Arc<StoreOptions>,
    seq: Arc<AtomicI64>,
}

impl std::fmt::Debug for TriggerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerStore")
            .field("instance_name", &self.options.instance_name)
            .finish_non_exhaustive()
    }
}

fn earliest_fire(triggers: &[StoredTrigger]) -> Option<DateTime<Utc>> {
    triggers
        .iter()
        .filter_map(|t| t.trigger.next_fire_time)
        .min()
}

impl TriggerStore {
    /// Connect to the configured backend and bootstrap its schema.
    pub async fn open(
        config: &StoreConfig,
        lock: SchedulerLock,
        options: StoreOptions,
    ) -> Result<Self, DbError> {
        let db = connect_db(config).await?;
        init_schema(&db, config).await?;
        Ok(Self::new(db, lock, options))
    }

    /// Wrap an already bootstrapped connection.
    pub fn new(db: Database, lock: SchedulerLock, options: StoreOptions) -> Self {
        // Seeded from the clock so insertion order survives restarts.
        let seed = Utc::now().timestamp_micros();
        Self {
            db,
            lock,
            options: Arc::new(options),
            seq: Arc::new(AtomicI64::new(seed)),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn lock(&self) -> &SchedulerLock {
        &self.lock
    }

    pub fn instance_name(&self) -> &str {
        &self.options.instance_name
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn retry(&self) -> &RetryPolicy {
        &self.options.retry
    }

    /// Store `job` with `trigger`, returning the job's next fire time.
    ///
    /// An existing trigger for the same job key is left alone unless
    /// `replace_existing` is set. With `keep_schedule`, a replacement starts at
    /// the earliest fire time of the triggers it replaces.
    pub async fn schedule(
        &self,
        job: &JobDefinition,
        trigger: Trigger,
        replace_existing: bool,
        keep_schedule: bool,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        trigger.schedule.validate()?;
        let trigger = &trigger;
        self.retry()
            .run("schedule", move || {
                self.schedule_once(job, trigger, replace_existing, keep_schedule)
            })
            .await
    }

    async fn schedule_once(
        &self,
        job: &JobDefinition,
        trigger: &Trigger,
        replace_existing: bool,
        keep_schedule: bool,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        if !replace_existing {
            let _shared = self.lock.read().await;
            let existing = TriggerRepository::for_job(&self.db, &job.key).await?;
            if !existing.is_empty() {
                tracing::debug!("Job {} already scheduled", job.key);
                return Ok(earliest_fire(&existing));
            }
        }

        let _exclusive = self.lock.write().await;

        let existing = TriggerRepository::for_job(&self.db, &job.key).await?;
        if !existing.is_empty() && !replace_existing {
            tracing::debug!("Job {} scheduled concurrently", job.key);
            return Ok(earliest_fire(&existing));
        }

        let mut trigger = trigger.clone();
        if !existing.is_empty() {
            if keep_schedule {
                if let Some(earliest) = earliest_fire(&existing) {
                    trigger = trigger.start_at(earliest);
                }
            }
            let removed = TriggerRepository::delete_for_job(&self.db, &job.key).await?;
            JobDetailRepository::delete(&self.db, &job.key).await?;
            tracing::debug!("Replacing {} trigger(s) of job {}", removed, job.key);
        }

        JobDetailRepository::upsert(&self.db, job).await?;
        let stored = TriggerRepository::insert(&self.db, &trigger, self.next_seq()).await?;

        tracing::info!(
            "Scheduled job {} (priority {}, next fire {:?})",
            job.key,
            stored.trigger.priority,
            stored.trigger.next_fire_time
        );

        Ok(stored.trigger.next_fire_time)
    }

    /// Fire `job` once, as soon as possible.
    ///
    /// Returns now without scheduling anything if the job is executing.
    pub async fn start_job(
        &self,
        job: &JobDefinition,
        priority: Priority,
        replace_existing: bool,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        if self.is_executing(&job.key).await? {
            tracing::debug!("Job {} is executing, not starting it again", job.key);
            return Ok(Some(Utc::now()));
        }

        let trigger = Trigger::now(&job.key).with_priority(priority);
        self.schedule(job, trigger, replace_existing, false).await
    }

    /// [`start_job`](Self::start_job) at [`Priority::NOW`].
    pub async fn start_job_now(
        &self,
        job: &JobDefinition,
        replace_existing: bool,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        self.start_job(job, Priority::NOW, replace_existing).await
    }

    /// Whether a job has an execution in progress.
    pub async fn is_executing(&self, key: &JobKey) -> Result<bool, DbError> {
        self.retry()
            .run("is_executing", move || async move {
                let _shared = self.lock.read().await;
                FiredTriggerRepository::is_executing(&self.db, key).await
            })
            .await
    }

    /// Triggers of a job, in insertion order.
    pub async fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<StoredTrigger>, DbError> {
        self.retry()
            .run("triggers_for_job", move || async move {
                let _shared = self.lock.read().await;
                TriggerRepository::for_job(&self.db, key).await
            })
            .await
    }

    /// Earliest next fire time among a job's triggers.
    pub async fn next_fire_time(&self, key: &JobKey) -> Result<Option<DateTime<Utc>>, DbError> {
        Ok(earliest_fire(&self.triggers_for_job(key).await?))
    }

    pub async fn get_job(&self, key: &JobKey) -> Result<Option<JobDefinition>, DbError> {
        self.retry()
            .run("get_job", move || async move {
                let _shared = self.lock.read().await;
                JobDetailRepository::get(&self.db, key).await
            })
            .await
    }

    /// Claim up to `max_count` waiting triggers due no later than
    /// `no_later_than`, highest priority first, then earliest fire time, then
    /// insertion order.
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<AcquiredTrigger>, DbError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        self.retry()
            .run("acquire_next_triggers", move || async move {
                let _shared = self.lock.read().await;
                self.with_named_lock(NamedLock::TriggerAccess, || {
                    self.acquire_locked(no_later_than, max_count)
                })
                .await
            })
            .await
    }

    async fn acquire_locked(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<AcquiredTrigger>, DbError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.options.misfire_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let candidates = TriggerRepository::ready(&self.db, no_later_than, max_count).await?;
        let mut acquired = Vec::with_capacity(candidates.len());

        for mut stored in candidates {
            let Some(job) = JobDetailRepository::get(&self.db, &stored.trigger.job_key).await?
            else {
                tracing::warn!(
                    "Trigger {} references missing job {}, removing it",
                    stored.trigger.key,
                    stored.trigger.job_key
                );
                TriggerRepository::delete(&self.db, &stored.id).await?;
                continue;
            };

            if !TriggerRepository::transition(
                &self.db,
                &stored.id,
                TriggerState::Waiting,
                TriggerState::Acquired,
            )
            .await?
            {
                continue;
            }

            let misfired = stored.trigger.is_misfired(now, threshold);
            if misfired {
                tracing::warn!(
                    "Trigger {} misfired (due {:?}), firing once now",
                    stored.trigger.key,
                    stored.trigger.next_fire_time
                );
            }

            stored.trigger.state = TriggerState::Acquired;
            acquired.push(AcquiredTrigger {
                stored,
                job,
                misfired,
            });
        }

        Ok(acquired)
    }

    async fn with_named_lock<T, F, Fut>(&self, lock: NamedLock, op: F) -> Result<T, DbError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, DbError>>,
    {
        LockRepository::acquire(
            &self.db,
            lock,
            &self.options.instance_name,
            self.options.lock_stale_after,
            self.options.lock_timeout,
        )
        .await?;

        let result = op().await;
        let released = LockRepository::release(&self.db, lock, &self.options.instance_name).await;

        let value = result?;
        released?;
        Ok(value)
    }

    /// Return an acquired trigger to waiting without firing it.
    ///
    /// `retry_at` moves the fire time (a filter deferral); `None` keeps it so
    /// the trigger is picked up again on the next tick.
    pub async fn release_acquired(
        &self,
        acquired: &AcquiredTrigger,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        self.retry()
            .run("release_acquired", move || async move {
                let _shared = self.lock.read().await;
                TriggerRepository::release(&self.db, &acquired.stored.id, retry_at).await
            })
            .await
    }

    /// Look up a trigger by storage id.
    pub async fn get_trigger(&self, id: &str) -> Result<Option<StoredTrigger>, DbError> {
        self.retry()
            .run("get_trigger", move || async move {
                let _shared = self.lock.read().await;
                TriggerRepository::get(&self.db, id).await
            })
            .await
    }

    /// Mark an acquired trigger as executing and record the execution.
    ///
    /// Returns `None` when the trigger was deleted or replaced since it was
    /// acquired.
    pub async fn trigger_fired(
        &self,
        acquired: &AcquiredTrigger,
    ) -> Result<Option<FiredTrigger>, DbError> {
        let id = FiredId::new();
        self.retry()
            .run("trigger_fired", move || async move {
                let _shared = self.lock.read().await;
                if !TriggerRepository::transition(
                    &self.db,
                    &acquired.stored.id,
                    TriggerState::Acquired,
                    TriggerState::Executing,
                )
                .await?
                {
                    return Ok(None);
                }

                let fired_at = Utc::now();
                let scheduled_at = acquired.trigger().next_fire_time.unwrap_or(fired_at);
                let record = FiredTriggerRecord {
                    entry_id: id.to_string(),
                    trigger_id: acquired.stored.id.clone(),
                    job_name: acquired.job.key.name.clone(),
                    job_group: acquired.job.key.group.clone(),
                    instance_name: self.options.instance_name.clone(),
                    fired_time: fired_at.timestamp_millis(),
                    sched_time: scheduled_at.timestamp_millis(),
                    priority: i64::from(acquired.trigger().priority.0),
                    state: TriggerState::Executing.as_str().to_string(),
                    requests_recovery: acquired.job.requests_recovery,
                };
                FiredTriggerRepository::insert(&self.db, &record).await?;

                let mut stored = acquired.stored.clone();
                stored.trigger.state = TriggerState::Executing;
                Ok(Some(FiredTrigger {
                    id,
                    stored,
                    job: acquired.job.clone(),
                    fired_at,
                    scheduled_at,
                }))
            })
            .await
    }

    /// Record the end of an execution and move its trigger on.
    pub async fn triggered_job_complete(
        &self,
        fired: &FiredTrigger,
        outcome: CompletionOutcome,
    ) -> Result<(), DbError> {
        self.retry()
            .run("triggered_job_complete", move || async move {
                let _exclusive = self.lock.write().await;
                FiredTriggerRepository::delete(&self.db, fired.id).await?;

                let Some(mut current) = TriggerRepository::get(&self.db, &fired.stored.id).await?
                else {
                    tracing::debug!(
                        "Trigger of job {} was replaced while it ran",
                        fired.job.key
                    );
                    return Ok(());
                };

                let paused = current.trigger.state == TriggerState::Paused;

                if let CompletionOutcome::Failed {
                    retry_at: Some(at),
                } = outcome
                {
                    current.trigger.next_fire_time = Some(at);
                    current.trigger.state = if paused {
                        TriggerState::Paused
                    } else {
                        TriggerState::Waiting
                    };
                    return TriggerRepository::save_progress(&self.db, &current).await;
                }

                if current.trigger.advance(fired.fired_at) {
                    if paused {
                        current.trigger.state = TriggerState::Paused;
                    }
                    TriggerRepository::save_progress(&self.db, &current).await
                } else {
                    TriggerRepository::delete(&self.db, &current.id).await?;
                    self.delete_job_if_orphaned(&fired.job).await
                }
            })
            .await
    }

    async fn delete_job_if_orphaned(&self, job: &JobDefinition) -> Result<(), DbError> {
        if job.durable {
            return Ok(());
        }
        if TriggerRepository::for_job(&self.db, &job.key)
            .await?
            .is_empty()
        {
            JobDetailRepository::delete(&self.db, &job.key).await?;
        }
        Ok(())
    }

    /// Repair state left behind by a process that stopped without draining.
    pub async fn recover_after_restart(&self) -> Result<RecoveryReport, DbError> {
        self.retry()
            .run("recover_after_restart", move || async move {
                let _exclusive = self.lock.write().await;
                for lock in NamedLock::ALL {
                    LockRepository::release(&self.db, lock, &self.options.instance_name).await?;
                }

                self.with_named_lock(NamedLock::StateAccess, || self.recover_locked())
                    .await
            })
            .await
    }

    async fn recover_locked(&self) -> Result<RecoveryReport, DbError> {
        let now = Utc::now();
        let mut report = RecoveryReport {
            released: TriggerRepository::transition_all(
                &self.db,
                TriggerState::Acquired,
                TriggerState::Waiting,
            )
            .await?,
            ..Default::default()
        };

        for mut stored in TriggerRepository::in_state(&self.db, TriggerState::Executing).await? {
            let Some(job) = JobDetailRepository::get(&self.db, &stored.trigger.job_key).await?
            else {
                TriggerRepository::delete(&self.db, &stored.id).await?;
                report.dropped += 1;
                continue;
            };

            if job.requests_recovery {
                stored.trigger.state = TriggerState::Waiting;
                stored.trigger.next_fire_time = Some(now);
                TriggerRepository::save_progress(&self.db, &stored).await?;
                report.recovered += 1;
            } else if stored.trigger.advance(now) {
                TriggerRepository::save_progress(&self.db, &stored).await?;
                report.advanced += 1;
            } else {
                TriggerRepository::delete(&self.db, &stored.id).await?;
                self.delete_job_if_orphaned(&job).await?;
                report.dropped += 1;
            }
        }

        FiredTriggerRepository::delete_all(&self.db).await?;

        tracing::info!(
            "Recovered trigger store: {} released, {} recovered, {} advanced, {} dropped",
            report.released,
            report.recovered,
            report.advanced,
            report.dropped
        );

        Ok(report)
    }

    /// Exclude a job's waiting triggers from acquisition.
    pub async fn pause_job(&self, key: &JobKey) -> Result<usize, DbError> {
        self.retry()
            .run("pause_job", move || async move {
                let _exclusive = self.lock.write().await;
                let mut paused = 0;
                for from in [TriggerState::Waiting, TriggerState::Executing] {
                    paused += TriggerRepository::transition_for_job(
                        &self.db,
                        key,
                        from,
                        TriggerState::Paused,
                    )
                    .await?;
                }
                Ok(paused)
            })
            .await
    }

    /// Return a job's paused triggers to waiting.
    ///
    /// A trigger whose fire time passed while paused fires once, now.
    pub async fn resume_job(&self, key: &JobKey) -> Result<usize, DbError> {
        self.retry()
            .run("resume_job", move || async move {
                let _exclusive = self.lock.write().await;
                let executing = FiredTriggerRepository::is_executing(&self.db, key).await?;
                let to = if executing {
                    TriggerState::Executing
                } else {
                    TriggerState::Waiting
                };
                TriggerRepository::transition_for_job(&self.db, key, TriggerState::Paused, to).await
            })
            .await
    }

    /// Delete a job and its triggers. Returns whether anything was removed.
    pub async fn delete_job(&self, key: &JobKey) -> Result<bool, DbError> {
        self.retry()
            .run("delete_job", move || async move {
                let _exclusive = self.lock.write().await;
                let existed = JobDetailRepository::exists(&self.db, key).await?;
                let removed = TriggerRepository::delete_for_job(&self.db, key).await?;
                JobDetailRepository::delete(&self.db, key).await?;
                Ok(existed || removed > 0)
            })
            .await
    }

    /// Delete every job, trigger and fired row.
    pub async fn clear(&self) -> Result<(), DbError> {
        self.retry()
            .run("clear", move || async move {
                let _exclusive = self.lock.write().await;
                TriggerRepository::delete_all(&self.db).await?;
                JobDetailRepository::delete_all(&self.db).await?;
                FiredTriggerRepository::delete_all(&self.db).await
            })
            .await
    }

    /// Triggers that are due or were deferred, whether waiting or acquired.
    pub async fn waiting_count(&self) -> Result<u64, DbError> {
        self.retry()
            .run("waiting_count", move || async move {
                let _shared = self.lock.read().await;
                TriggerRepository::count_waiting(&self.db, Utc::now()).await
            })
            .await
    }

    /// Keys of jobs with an execution in progress.
    pub async fn executing_job_keys(&self) -> Result<Vec<JobKey>, DbError> {
        self.retry()
            .run("executing_job_keys", move || async move {
                let _shared = self.lock.read().await;
                FiredTriggerRepository::executing_jobs(&self.db).await
            })
            .await
    }

    /// Record that this instance is alive.
    pub async fn heartbeat(&self) -> Result<(), DbError> {
        let interval_ms = self.options.checkin_interval.as_millis() as i64;
        self.retry()
            .run("heartbeat", move || {
                SchedulerStateRepository::check_in(
                    &self.db,
                    &self.options.instance_name,
                    Utc::now(),
                    interval_ms,
                )
            })
            .await
    }

    /// Last heartbeat of this instance.
    pub async fn last_heartbeat(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        self.retry()
            .run("last_heartbeat", move || {
                SchedulerStateRepository::last_check_in(&self.db, &self.options.instance_name)
            })
            .await
    }
}

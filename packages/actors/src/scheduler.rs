//! Scheduler actor: the dispatch loop over the trigger store.
//!
//! On every tick the scheduler claims due triggers, runs them past the
//! concurrency groups and the acquisition filters, and hands the survivors to
//! idle workers. Completions come back as [`SchedulerMessage::JobFinished`]
//! and move the trigger on in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use db::{AcquiredTrigger, CompletionOutcome, FiredTrigger, TriggerStore};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use sched_core::{
    ActiveJob, FiredId, JobSpec, ProcessorSnapshot, QueueStateSnapshot, QueueStateStruct,
    SchedulerEvent,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::concurrency::{ConcurrencyGroups, ConcurrencyPermit};
use crate::error::JobError;
use crate::filters::{Admission, FilterChain};
use crate::job::JobRegistry;
use crate::messages::{
    DispatchedJob, JobOutcome, SchedulerMessage, SchedulerStatus, WorkerMessage,
};
use crate::reporter::QueueStateReporter;
use crate::settings::SchedulerSettings;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Acquisition rounds per tick before held triggers are released.
const MAX_SCAN_ROUNDS: usize = 16;

/// Scheduler actor arguments.
pub struct SchedulerArgs {
    pub store: TriggerStore,
    pub registry: Arc<JobRegistry>,
    pub filters: FilterChain,
    pub groups: ConcurrencyGroups,
    pub settings: SchedulerSettings,
    pub events: broadcast::Sender<SchedulerEvent>,
    pub queue_state: broadcast::Sender<QueueStateSnapshot>,
}

impl SchedulerArgs {
    pub fn new(store: TriggerStore, registry: JobRegistry, settings: SchedulerSettings) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (queue_state, _) = broadcast::channel(256);
        Self {
            store,
            registry: Arc::new(registry),
            filters: FilterChain::default(),
            groups: ConcurrencyGroups::default(),
            settings,
            events,
            queue_state,
        }
    }

    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_groups(mut self, groups: ConcurrencyGroups) -> Self {
        self.groups = groups;
        self
    }
}

struct WorkerSlot {
    id: String,
    actor: ActorRef<WorkerMessage>,
    running: Option<FiredId>,
}

struct RunningJob {
    fired: FiredTrigger,
    spec: JobSpec,
    state: QueueStateStruct,
    cancel: CancellationToken,
    started: Instant,
    order: u64,
    permit: ConcurrencyPermit,
}

/// State for the scheduler actor.
pub struct SchedulerState {
    store: TriggerStore,
    registry: Arc<JobRegistry>,
    filters: FilterChain,
    groups: ConcurrencyGroups,
    settings: SchedulerSettings,
    events: broadcast::Sender<SchedulerEvent>,
    reporter: QueueStateReporter,
    workers: Vec<WorkerSlot>,
    running: HashMap<FiredId, RunningJob>,
    /// Failed runs so far, by trigger id, for recoverable jobs.
    attempts: HashMap<String, u32>,
    /// Last deferral reason, by trigger id.
    deferred: HashMap<String, String>,
    shutdown: CancellationToken,
    shutdown_waiters: Vec<RpcReplyPort<()>>,
    paused: bool,
    shutting_down: bool,
    waiting: usize,
    started: u64,
}

impl SchedulerState {
    fn emit(&self, event: SchedulerEvent) {
        tracing::trace!("{}", event.description());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn idle_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.running.is_none()).count()
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            paused: self.paused,
            shutting_down: self.shutting_down,
            pool_size: self.workers.len(),
            idle_workers: self.idle_workers(),
            running: self.running.len(),
            deferred: self.deferred.len(),
            queue_state: self.reporter.current().clone(),
        }
    }

    async fn publish(&mut self) {
        match self.store.waiting_count().await {
            Ok(count) => self.waiting = count as usize,
            Err(e) => tracing::debug!("Could not count waiting triggers: {}", e),
        }

        let active = self
            .running
            .iter()
            .max_by_key(|(_, job)| job.order)
            .map(|(id, job)| ActiveJob {
                id: id.to_string(),
                state: job.state.clone(),
            });

        let processor = ProcessorSnapshot {
            paused: self.paused || self.shutting_down,
            executing_count: self.running.len(),
            waiting_count: self.waiting,
            active,
        };

        if let Some(snapshot) = self.reporter.publish(&processor) {
            self.emit(SchedulerEvent::QueueStateChanged {
                snapshot,
                timestamp: Utc::now(),
            });
        }
    }

    /// Claim due triggers and start as many as the idle workers allow.
    ///
    /// Triggers that cannot start yet stay acquired until the scan ends, so
    /// each further batch reaches the work queued behind them.
    async fn fill_workers(&mut self) {
        let fire_ahead = chrono::Duration::from_std(self.settings.fire_ahead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut held: Vec<(AcquiredTrigger, Option<String>)> = Vec::new();

        for _ in 0..MAX_SCAN_ROUNDS {
            let idle = self.idle_workers();
            if idle == 0 {
                break;
            }
            let batch = idle.saturating_mul(2).max(1);

            let acquired = match self
                .store
                .acquire_next_triggers(Utc::now() + fire_ahead, batch)
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    tracing::warn!("Failed to acquire triggers: {}", e);
                    break;
                }
            };
            let exhausted = acquired.len() < batch;

            for acquired in acquired {
                if self.idle_workers() == 0 {
                    held.push((acquired, None));
                    continue;
                }
                if let Some(blocked) = self.dispatch(acquired).await {
                    held.push(blocked);
                }
            }

            if exhausted {
                break;
            }
        }

        for (acquired, reason) in held {
            self.release(&acquired, None, reason).await;
        }
    }

    async fn release(
        &mut self,
        acquired: &AcquiredTrigger,
        retry_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) {
        let trigger_id = acquired.stored.id.clone();
        match self.store.release_acquired(acquired, retry_at).await {
            Ok(true) => {}
            Ok(false) => {
                // Deleted or replaced while it was held.
                self.deferred.remove(&trigger_id);
                return;
            }
            Err(e) => tracing::warn!(
                "Failed to release trigger of job {}: {}",
                acquired.job_key(),
                e
            ),
        }

        let Some(reason) = reason else {
            return;
        };
        if self.deferred.get(&trigger_id) == Some(&reason) {
            return;
        }

        tracing::debug!("Deferring job {}: {}", acquired.job_key(), reason);
        self.emit(SchedulerEvent::JobDeferred {
            job_key: acquired.job_key().clone(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        self.deferred.insert(trigger_id, reason);
    }

    /// Forget deferrals and retry counts of triggers that no longer exist.
    async fn prune_deferred(&mut self) {
        let mut ids: Vec<String> = self.deferred.keys().cloned().collect();
        ids.extend(
            self.attempts
                .keys()
                .filter(|id| !self.deferred.contains_key(*id))
                .cloned(),
        );

        for id in ids {
            match self.store.get_trigger(&id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.deferred.remove(&id);
                    self.attempts.remove(&id);
                }
                Err(e) => {
                    tracing::debug!("Could not look up trigger {}: {}", id, e);
                    return;
                }
            }
        }
    }

    /// Start one acquired trigger.
    ///
    /// Returns the trigger when it must wait for a concurrency permit or a
    /// worker; the caller releases it.
    async fn dispatch(
        &mut self,
        acquired: AcquiredTrigger,
    ) -> Option<(AcquiredTrigger, Option<String>)> {
        let Some(job) = self.registry.get(&acquired.job.job_type) else {
            tracing::warn!(
                "No job registered for type {}; deleting job {}",
                acquired.job.job_type,
                acquired.job_key()
            );
            if let Err(e) = self.store.delete_job(acquired.job_key()).await {
                tracing::warn!("Failed to delete job {}: {}", acquired.job_key(), e);
            }
            self.deferred.remove(&acquired.stored.id);
            return None;
        };
        let spec = job.spec().clone();

        // Capacity first: filters may spend rate-limit tokens.
        let permit = match self.groups.try_acquire(&spec) {
            Ok(permit) => permit,
            Err(denied) => return Some((acquired, Some(denied.to_string()))),
        };

        if let Admission::Deny { filter, reason } = self.filters.admit(&spec) {
            drop(permit);
            let recheck = chrono::Duration::from_std(self.settings.filter_recheck)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
            let reason = format!("{}: {}", filter, reason);
            self.release(&acquired, Some(Utc::now() + recheck), Some(reason))
                .await;
            return None;
        }

        let Some(slot) = self.workers.iter().position(|w| w.running.is_none()) else {
            return Some((acquired, None));
        };

        let fired = match self.store.trigger_fired(&acquired).await {
            Ok(Some(fired)) => fired,
            Ok(None) => {
                tracing::debug!(
                    "Trigger of job {} changed before it fired",
                    acquired.job_key()
                );
                self.deferred.remove(&acquired.stored.id);
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to fire job {}: {}", acquired.job_key(), e);
                return Some((acquired, None));
            }
        };
        self.deferred.remove(&fired.stored.id);

        if acquired.misfired {
            self.emit(SchedulerEvent::TriggerMisfired {
                trigger_key: acquired.trigger().key.clone(),
                scheduled: fired.scheduled_at,
                timestamp: Utc::now(),
            });
        }

        let cancel = self.shutdown.child_token();
        let state = job.describe(&fired.job.data);
        let dispatched = DispatchedJob {
            fired: fired.clone(),
            job,
            cancel: cancel.clone(),
        };

        let worker = &mut self.workers[slot];
        if let Err(e) = worker.actor.send_message(WorkerMessage::ProcessJob {
            job: Box::new(dispatched),
        }) {
            tracing::warn!("Worker {} is unavailable: {}", worker.id, e);
            let outcome = CompletionOutcome::Failed {
                retry_at: Some(Utc::now()),
            };
            if let Err(e) = self.store.triggered_job_complete(&fired, outcome).await {
                tracing::warn!("Failed to return job {}: {}", fired.job_key(), e);
            }
            return None;
        }
        worker.running = Some(fired.id);
        let worker_id = worker.id.clone();

        tracing::info!(
            "Starting job {} ({}) on {}",
            fired.job_key(),
            fired.job.job_type,
            worker_id
        );
        self.emit(SchedulerEvent::JobStarted {
            job_key: fired.job_key().clone(),
            fired_id: fired.id,
            worker_id,
            timestamp: Utc::now(),
        });

        self.started += 1;
        self.running.insert(
            fired.id,
            RunningJob {
                fired,
                spec,
                state,
                cancel,
                started: Instant::now(),
                order: self.started,
                permit,
            },
        );
        None
    }

    /// When a failed run may go again, if at all.
    fn retry_at(
        &mut self,
        spec: &JobSpec,
        trigger_id: &str,
        error: &JobError,
    ) -> Option<DateTime<Utc>> {
        if !spec.recoverable {
            self.attempts.remove(trigger_id);
            return None;
        }

        if *error == JobError::Cancelled {
            return Some(Utc::now());
        }

        let attempts = self.attempts.entry(trigger_id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts > self.settings.job_max_retries {
            self.attempts.remove(trigger_id);
            return None;
        }

        let delay = chrono::Duration::from_std(self.settings.job_retry_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Some(Utc::now() + delay)
    }

    async fn finish_job(&mut self, fired_id: FiredId, outcome: JobOutcome) {
        let Some(running) = self.running.remove(&fired_id) else {
            tracing::warn!("Finished job {} is not running", fired_id);
            return;
        };
        if let Some(worker) = self
            .workers
            .iter_mut()
            .find(|w| w.running == Some(fired_id))
        {
            worker.running = None;
        }

        let RunningJob {
            fired,
            spec,
            started,
            permit,
            ..
        } = running;
        drop(permit);

        let job_key = fired.job_key().clone();
        let trigger_id = fired.stored.id.clone();
        self.deferred.remove(&trigger_id);
        let duration_ms = started.elapsed().as_millis() as u64;

        let completion = match outcome {
            JobOutcome::Completed(result) => {
                self.attempts.remove(&trigger_id);
                tracing::info!(
                    "Job {} completed in {}ms: {}",
                    job_key,
                    duration_ms,
                    result.summary
                );
                self.emit(SchedulerEvent::JobCompleted {
                    job_key,
                    fired_id,
                    duration_ms,
                    timestamp: Utc::now(),
                });
                CompletionOutcome::Succeeded
            }
            JobOutcome::Failed(error) => {
                let retry_at = self.retry_at(&spec, &trigger_id, &error);
                tracing::warn!(
                    "Job {} failed after {}ms: {}{}",
                    job_key,
                    duration_ms,
                    error,
                    if retry_at.is_some() { " (will retry)" } else { "" }
                );
                self.emit(SchedulerEvent::JobFailed {
                    job_key,
                    fired_id,
                    error: error.to_string(),
                    will_retry: retry_at.is_some(),
                    timestamp: Utc::now(),
                });
                CompletionOutcome::Failed { retry_at }
            }
        };

        if let Err(e) = self.store.triggered_job_complete(&fired, completion).await {
            tracing::error!(
                "Failed to record completion of job {}: {}",
                fired.job_key(),
                e
            );
        }
    }

    fn stop(&mut self, myself: &ActorRef<SchedulerMessage>) {
        for worker in &self.workers {
            let _ = worker.actor.send_message(WorkerMessage::Shutdown);
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!("Scheduler {} stopped", self.settings.instance_name);
        myself.stop(None);
    }

    async fn spawn_worker(
        &self,
        myself: &ActorRef<SchedulerMessage>,
        index: usize,
    ) -> Result<WorkerSlot, ActorProcessingErr> {
        let id = format!("worker-{}", index);
        let args = WorkerArgs {
            worker_id: id.clone(),
            scheduler: myself.clone(),
        };
        let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

        Ok(WorkerSlot {
            id,
            actor,
            running: None,
        })
    }
}

/// Scheduler actor that owns the worker pool.
pub struct SchedulerActor;

impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting scheduler {} with {} worker(s)",
            args.settings.instance_name,
            args.settings.pool_size
        );

        match args.store.recover_after_restart().await {
            Ok(report) => tracing::info!(
                "Recovered store: {} released, {} re-run, {} advanced, {} dropped",
                report.released,
                report.recovered,
                report.advanced,
                report.dropped
            ),
            Err(e) => tracing::warn!("Store recovery failed: {}", e),
        }

        let mut state = SchedulerState {
            store: args.store,
            registry: args.registry,
            filters: args.filters,
            groups: args.groups,
            reporter: QueueStateReporter::with_sender("scheduler", args.queue_state),
            events: args.events,
            workers: Vec::with_capacity(args.settings.pool_size),
            settings: args.settings,
            running: HashMap::new(),
            attempts: HashMap::new(),
            deferred: HashMap::new(),
            shutdown: CancellationToken::new(),
            shutdown_waiters: Vec::new(),
            paused: false,
            shutting_down: false,
            waiting: 0,
            started: 0,
        };

        for index in 0..state.settings.pool_size {
            let slot = state.spawn_worker(&myself, index).await?;
            state.workers.push(slot);
        }

        // Dispatch loop
        let myself_clone = myself.clone();
        let tick = state.settings.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SchedulerMessage::Tick).is_err() {
                    break;
                }
            }
        });

        // Heartbeat
        let myself_clone = myself.clone();
        let every = state.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SchedulerMessage::Heartbeat).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Tick => {
                if !state.paused && !state.shutting_down {
                    state.fill_workers().await;
                }
                state.publish().await;
            }

            SchedulerMessage::Heartbeat => {
                if let Err(e) = state.store.heartbeat().await {
                    tracing::warn!("Heartbeat failed: {}", e);
                }
                state.prune_deferred().await;
            }

            SchedulerMessage::JobFinished {
                fired_id,
                worker_id,
                outcome,
            } => {
                tracing::debug!("Worker {} finished {}", worker_id, fired_id);
                state.finish_job(fired_id, outcome).await;
                state.publish().await;

                if state.shutting_down {
                    if state.running.is_empty() {
                        state.stop(&myself);
                    }
                } else if !state.paused {
                    myself.send_message(SchedulerMessage::Tick)?;
                }
            }

            SchedulerMessage::Pause => {
                if !state.paused {
                    tracing::info!("Pausing scheduler");
                    state.paused = true;
                    state.emit(SchedulerEvent::SchedulerPaused {
                        timestamp: Utc::now(),
                    });
                }
                state.publish().await;
            }

            SchedulerMessage::Resume => {
                if state.paused {
                    tracing::info!("Resuming scheduler");
                    state.paused = false;
                    state.emit(SchedulerEvent::SchedulerResumed {
                        timestamp: Utc::now(),
                    });
                }
                myself.send_message(SchedulerMessage::Tick)?;
            }

            SchedulerMessage::GetStatus { reply } => {
                let _ = reply.send(state.status());
            }

            SchedulerMessage::Shutdown {
                wait_for_jobs,
                reply,
            } => {
                if !state.shutting_down {
                    tracing::info!(
                        "Shutting down scheduler; cancelling {} running job(s)",
                        state.running.len()
                    );
                    state.shutting_down = true;
                    state.shutdown.cancel();
                    state.emit(SchedulerEvent::SchedulerShutdown {
                        timestamp: Utc::now(),
                    });
                }
                if let Some(reply) = reply {
                    state.shutdown_waiters.push(reply);
                }

                if !wait_for_jobs || state.running.is_empty() {
                    state.stop(&myself);
                } else {
                    state.publish().await;
                }
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                (cell, reason.unwrap_or_else(|| "stopped".to_string()))
            }
            SupervisionEvent::ActorFailed(cell, err) => (cell, err.to_string()),
            _ => return Ok(()),
        };

        let Some(index) = state
            .workers
            .iter()
            .position(|w| w.actor.get_id() == cell.get_id())
        else {
            return Ok(());
        };
        if state.shutting_down {
            return Ok(());
        }

        tracing::warn!("Worker {} exited: {}", state.workers[index].id, reason);

        if let Some(fired_id) = state.workers[index].running.take() {
            let outcome = JobOutcome::Failed(JobError::Panicked(reason));
            if let Some(job) = state.running.get(&fired_id) {
                job.cancel.cancel();
            }
            state.finish_job(fired_id, outcome).await;
        }

        let slot = state.spawn_worker(&myself, index).await?;
        state.workers[index] = slot;
        state.publish().await;
        Ok(())
    }
}

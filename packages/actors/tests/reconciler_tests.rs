mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::builtin::{
    NetworkProbe, ProbeFuture, check_network_job, check_network_spec, check_trakt_token_job,
    check_trakt_token_spec, recurring_jobs,
};
use actors::{
    JobRegistry, NetworkState, ReconcileOutcome, Reconciler, RecurringJob, SchedulerError,
};
use db::repositories::{JobDetailRepository, TriggerRepository};
use sched_core::{JobData, JobDefinition, JobSpec, Priority, Schedule, Trigger, WorkCategory};

use common::{Tracker, fast_settings, setup_store, tracked_job};

const CHECK_TOKEN: &str = "CheckTraktToken";

fn token_spec() -> JobSpec {
    JobSpec::new(CHECK_TOKEN, WorkCategory::CheckingTraktToken)
        .with_group("System")
        .requires_network()
        .with_priority(Priority::RECURRING)
}

async fn setup() -> Result<Reconciler, Box<dyn Error>> {
    let store = setup_store(&fast_settings(1)).await?;
    let registry = JobRegistry::new().with(tracked_job(
        token_spec(),
        Arc::new(Tracker::default()),
        Duration::ZERO,
    ));
    Ok(Reconciler::new(store, Arc::new(registry)))
}

fn token_job() -> JobDefinition {
    JobDefinition::for_spec(&token_spec(), JobData::new())
}

#[tokio::test]
async fn test_reconcile_creates_trigger_firing_now() -> Result<(), Box<dyn Error>> {
    let reconciler = setup().await?;
    let before = chrono::Utc::now();

    let outcome = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60)))
        .await?;

    assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
    let next = outcome.next_fire().ok_or("no fire time")?;
    assert!(next <= chrono::Utc::now());
    assert!(next >= before - chrono::Duration::milliseconds(1));
    Ok(())
}

#[tokio::test]
async fn test_reconcile_without_replace_is_a_no_op() -> Result<(), Box<dyn Error>> {
    let reconciler = setup().await?;

    let first = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60)))
        .await?;
    let again = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(5)))
        .await?;

    assert!(matches!(again, ReconcileOutcome::Unchanged { .. }));
    assert_eq!(first.next_fire(), again.next_fire());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_reconcile_creates_one_trigger() -> Result<(), Box<dyn Error>> {
    let store = setup_store(&fast_settings(1)).await?;
    let registry = Arc::new(JobRegistry::new().with(tracked_job(
        token_spec(),
        Arc::new(Tracker::default()),
        Duration::ZERO,
    )));
    let a = Reconciler::new(store.clone(), registry.clone());
    let b = Reconciler::new(store.clone(), registry);
    let declared = RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60));

    let (first, second) = tokio::join!(a.reconcile(&declared), b.reconcile(&declared));
    first?;
    second?;

    assert_eq!(store.triggers_for_job(&token_job().key).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_replace_keep_schedule_preserves_fire_time() -> Result<(), Box<dyn Error>> {
    let store = setup_store(&fast_settings(1)).await?;
    let registry = Arc::new(JobRegistry::new().with(tracked_job(
        token_spec(),
        Arc::new(Tracker::default()),
        Duration::ZERO,
    )));
    let reconciler = Reconciler::new(store.clone(), registry);

    let created = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60)))
        .await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let replaced = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(30)).replace(true))
        .await?;

    assert!(matches!(replaced, ReconcileOutcome::Replaced { .. }));
    assert_eq!(created.next_fire(), replaced.next_fire());

    let triggers = store.triggers_for_job(&token_job().key).await?;
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger.schedule, Schedule::every_minutes(30));
    Ok(())
}

#[tokio::test]
async fn test_replace_without_keep_schedule_restarts() -> Result<(), Box<dyn Error>> {
    let reconciler = setup().await?;

    let created = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60)))
        .await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let replaced = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60)).replace(false))
        .await?;

    assert!(replaced.next_fire() > created.next_fire());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_triggers_collapse_to_one() -> Result<(), Box<dyn Error>> {
    let store = setup_store(&fast_settings(1)).await?;
    let registry = Arc::new(JobRegistry::new().with(tracked_job(
        token_spec(),
        Arc::new(Tracker::default()),
        Duration::ZERO,
    )));
    let reconciler = Reconciler::new(store.clone(), registry);

    let job = token_job();
    JobDetailRepository::upsert(store.db(), &job).await?;
    let earliest = chrono::Utc::now() - chrono::Duration::minutes(5);
    let early = Trigger::new(&job.key, Schedule::every_minutes(60)).start_at(earliest);
    let late = Trigger::new(&job.key, Schedule::every_minutes(60));
    TriggerRepository::insert(store.db(), &early, 1).await?;
    TriggerRepository::insert(store.db(), &late, 2).await?;

    let outcome = reconciler
        .reconcile(&RecurringJob::new(CHECK_TOKEN, Schedule::every_minutes(60)))
        .await?;

    let triggers = store.triggers_for_job(&job.key).await?;
    assert_eq!(triggers.len(), 1);
    assert_eq!(
        outcome.next_fire().map(|t| t.timestamp_millis()),
        Some(earliest.timestamp_millis())
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_job_type_is_rejected() -> Result<(), Box<dyn Error>> {
    let reconciler = setup().await?;

    let result = reconciler
        .reconcile(&RecurringJob::new("NoSuchJob", Schedule::every_minutes(10)))
        .await;

    assert!(matches!(result, Err(SchedulerError::UnknownJobType(t)) if t == "NoSuchJob"));
    Ok(())
}

#[tokio::test]
async fn test_startup_reconciles_every_builtin_job() -> Result<(), Box<dyn Error>> {
    let store = setup_store(&fast_settings(1)).await?;
    let reachable: NetworkProbe = Arc::new(|| -> ProbeFuture { Box::pin(async { true }) });
    let registry = JobRegistry::new()
        .with(check_network_job(NetworkState::new(false), reachable))
        .with(check_trakt_token_job());
    let reconciler = Reconciler::new(store.clone(), Arc::new(registry));

    let outcomes = reconciler.reconcile_all(&recurring_jobs()).await?;
    assert_eq!(outcomes.len(), 2);
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ReconcileOutcome::Created { .. }))
    );

    // A second startup replaces each trigger instead of adding one.
    let outcomes = reconciler.reconcile_all(&recurring_jobs()).await?;
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ReconcileOutcome::Replaced { .. }))
    );

    for spec in [check_network_spec(), check_trakt_token_spec()] {
        let key = JobDefinition::for_spec(&spec, JobData::new()).key;
        assert_eq!(store.triggers_for_job(&key).await?.len(), 1);
    }
    Ok(())
}

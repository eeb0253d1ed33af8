#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Utc};
use db::{CompletionOutcome, StoreConfig, StoreOptions, connect_db, init_schema};
use sched_core::{Priority, Schedule, Trigger, TriggerState};
use serde_json::json;

use common::{job, setup_store, setup_store_with};

#[tokio::test]
async fn test_schedule_twice_keeps_one_trigger() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let update = job("UpdateSeries", &[("SeriesID", json!(76885))]);

    let first = store
        .schedule(&update, Trigger::now(&update.key), false, false)
        .await?;
    let second = store
        .schedule(
            &update,
            Trigger::now(&update.key).with_priority(Priority::NOW),
            false,
            false,
        )
        .await?;

    assert_eq!(first, second);
    let triggers = store.triggers_for_job(&update.key).await?;
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger.priority, Priority::DEFAULT);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_producers_create_one_trigger() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let hash = job("HashFile", &[("FileID", json!(12))]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let hash = hash.clone();
        handles.push(tokio::spawn(async move {
            store
                .schedule(&hash, Trigger::now(&hash.key), false, false)
                .await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert_eq!(store.triggers_for_job(&hash.key).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_replace_keep_schedule_preserves_earliest_fire() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let check = job("CheckNetworkAvailability", &[]);
    let due = Utc::now() + TimeDelta::minutes(17);

    let original = Trigger::new(&check.key, Schedule::every_minutes(30)).start_at(due);
    store.schedule(&check, original, false, false).await?;

    let replacement = Trigger::new(&check.key, Schedule::every_minutes(30))
        .with_priority(Priority::RECURRING);
    let next = store.schedule(&check, replacement, true, true).await?;

    let triggers = store.triggers_for_job(&check.key).await?;
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger.priority, Priority::RECURRING);
    assert_eq!(
        next.map(|t| t.timestamp_millis()),
        Some(due.timestamp_millis())
    );
    Ok(())
}

#[tokio::test]
async fn test_replace_without_keep_schedule_fires_now() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let check = job("CheckNetworkAvailability", &[]);
    let later = Utc::now() + TimeDelta::hours(2);

    store
        .schedule(
            &check,
            Trigger::new(&check.key, Schedule::every_minutes(30)).start_at(later),
            false,
            false,
        )
        .await?;
    let next = store
        .schedule(
            &check,
            Trigger::new(&check.key, Schedule::every_minutes(30)),
            true,
            false,
        )
        .await?
        .ok_or("missing fire time")?;

    assert!(next < later);
    assert_eq!(store.triggers_for_job(&check.key).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_acquisition_order() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let base = Utc::now() - TimeDelta::seconds(10);

    let low = job("Scan", &[("n", json!("low"))]);
    let high_late = job("Scan", &[("n", json!("high-late"))]);
    let high_early = job("Scan", &[("n", json!("high-early"))]);
    let tie_first = job("Scan", &[("n", json!("tie-first"))]);
    let tie_second = job("Scan", &[("n", json!("tie-second"))]);

    let at = |job: &sched_core::JobDefinition, offset: i64, priority: i32| {
        Trigger::now(&job.key)
            .start_at(base + TimeDelta::seconds(offset))
            .with_priority(Priority(priority))
    };

    store.schedule(&low, at(&low, 0, 1), false, false).await?;
    store
        .schedule(&high_late, at(&high_late, 5, 9), false, false)
        .await?;
    store
        .schedule(&high_early, at(&high_early, 1, 9), false, false)
        .await?;
    store
        .schedule(&tie_first, at(&tie_first, 3, 5), false, false)
        .await?;
    store
        .schedule(&tie_second, at(&tie_second, 3, 5), false, false)
        .await?;

    let acquired = store.acquire_next_triggers(Utc::now(), 10).await?;
    let order: Vec<_> = acquired.iter().map(|a| a.job.key.clone()).collect();
    assert_eq!(
        order,
        vec![
            high_early.key.clone(),
            high_late.key.clone(),
            tie_first.key.clone(),
            tie_second.key.clone(),
            low.key.clone(),
        ]
    );

    // Claimed triggers are not handed out twice.
    assert!(store.acquire_next_triggers(Utc::now(), 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_future_triggers_are_not_acquired() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let later = job("Scan", &[("n", json!(1))]);
    store
        .schedule(
            &later,
            Trigger::now(&later.key).start_at(Utc::now() + TimeDelta::minutes(5)),
            false,
            false,
        )
        .await?;

    assert!(store.acquire_next_triggers(Utc::now(), 5).await?.is_empty());
    assert_eq!(
        store
            .acquire_next_triggers(Utc::now() + TimeDelta::minutes(6), 5)
            .await?
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_release_defers_trigger() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let fetch = job("FetchSeries", &[("id", json!(3))]);
    store
        .schedule(&fetch, Trigger::now(&fetch.key), false, false)
        .await?;

    let acquired = store.acquire_next_triggers(Utc::now(), 1).await?;
    assert_eq!(acquired.len(), 1);

    let retry_at = Utc::now() + TimeDelta::milliseconds(500);
    assert!(store.release_acquired(&acquired[0], Some(retry_at)).await?);

    let triggers = store.triggers_for_job(&fetch.key).await?;
    assert_eq!(triggers[0].trigger.state, TriggerState::Waiting);
    assert!(store.acquire_next_triggers(Utc::now(), 1).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.acquire_next_triggers(Utc::now(), 1).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_waiting_count_includes_deferred_and_acquired() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let fetch = job("FetchSeries", &[("id", json!(4))]);
    let later = job("FetchSeries", &[("id", json!(5))]);
    store
        .schedule(&fetch, Trigger::now(&fetch.key), false, false)
        .await?;
    store
        .schedule(
            &later,
            Trigger::now(&later.key).start_at(Utc::now() + TimeDelta::minutes(5)),
            false,
            false,
        )
        .await?;
    assert_eq!(store.waiting_count().await?, 1);

    let acquired = store.acquire_next_triggers(Utc::now(), 1).await?;
    assert_eq!(acquired.len(), 1);
    assert_eq!(store.waiting_count().await?, 1);

    let retry_at = Utc::now() + TimeDelta::minutes(1);
    assert!(store.release_acquired(&acquired[0], Some(retry_at)).await?);
    assert_eq!(store.waiting_count().await?, 1);

    // Running clears the deferral.
    let acquired = store
        .acquire_next_triggers(retry_at + TimeDelta::seconds(1), 1)
        .await?;
    assert_eq!(acquired.len(), 1);
    let fired = store
        .trigger_fired(&acquired[0])
        .await?
        .ok_or("trigger vanished")?;
    assert_eq!(store.waiting_count().await?, 0);
    store
        .triggered_job_complete(&fired, CompletionOutcome::Succeeded)
        .await?;
    assert_eq!(store.waiting_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_fire_now_trigger_completes_and_removes_job() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let hash = job("HashFile", &[("FileID", json!(1))]);
    store.start_job_now(&hash, false).await?;

    let acquired = store.acquire_next_triggers(Utc::now(), 1).await?;
    assert_eq!(acquired[0].trigger().priority, Priority::NOW);

    let fired = store
        .trigger_fired(&acquired[0])
        .await?
        .ok_or("trigger vanished")?;
    assert!(store.is_executing(&hash.key).await?);
    assert_eq!(store.executing_job_keys().await?, vec![hash.key.clone()]);

    // Starting an executing job is a no-op.
    store.start_job_now(&hash, true).await?;
    assert_eq!(store.triggers_for_job(&hash.key).await?.len(), 1);

    store
        .triggered_job_complete(&fired, CompletionOutcome::Succeeded)
        .await?;

    assert!(!store.is_executing(&hash.key).await?);
    assert!(store.triggers_for_job(&hash.key).await?.is_empty());
    assert!(store.get_job(&hash.key).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_recurring_trigger_advances_without_replay() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let check = job("CheckNetworkAvailability", &[]);
    // Started well in the past: several intervals were missed.
    let start = Utc::now() - TimeDelta::minutes(95);
    store
        .schedule(
            &check,
            Trigger::new(&check.key, Schedule::every_minutes(30)).start_at(start),
            false,
            false,
        )
        .await?;

    let acquired = store.acquire_next_triggers(Utc::now(), 1).await?;
    assert!(acquired[0].misfired);
    let fired = store
        .trigger_fired(&acquired[0])
        .await?
        .ok_or("trigger vanished")?;
    store
        .triggered_job_complete(&fired, CompletionOutcome::Succeeded)
        .await?;

    let triggers = store.triggers_for_job(&check.key).await?;
    let trigger = &triggers[0].trigger;
    assert_eq!(trigger.state, TriggerState::Waiting);
    assert_eq!(trigger.times_triggered, 1);
    let next = trigger.next_fire_time.ok_or("no next fire")?;
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + TimeDelta::minutes(30));

    // Nothing else is due: missed slots were not queued up.
    assert!(store.acquire_next_triggers(Utc::now(), 5).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_execution_is_retried() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let hash = job("HashFile", &[("FileID", json!(2))]);
    store.start_job(&hash, Priority::DEFAULT, false).await?;

    let acquired = store.acquire_next_triggers(Utc::now(), 1).await?;
    let fired = store
        .trigger_fired(&acquired[0])
        .await?
        .ok_or("trigger vanished")?;

    let retry_at = Utc::now() + TimeDelta::seconds(30);
    store
        .triggered_job_complete(
            &fired,
            CompletionOutcome::Failed {
                retry_at: Some(retry_at),
            },
        )
        .await?;

    let triggers = store.triggers_for_job(&hash.key).await?;
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger.state, TriggerState::Waiting);
    assert_eq!(
        triggers[0].trigger.next_fire_time.map(|t| t.timestamp_millis()),
        Some(retry_at.timestamp_millis())
    );
    Ok(())
}

#[tokio::test]
async fn test_recover_after_restart() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;

    let recoverable = job("UpdateSeries", &[("SeriesID", json!(1))]).with_recovery(true);
    let abandoned = job("HashFile", &[("FileID", json!(9))]);
    let claimed = job("Scan", &[("n", json!(1))]);

    for j in [&recoverable, &abandoned] {
        store.schedule(j, Trigger::now(&j.key), false, false).await?;
    }
    for acquired in store.acquire_next_triggers(Utc::now(), 10).await? {
        store.trigger_fired(&acquired).await?;
    }
    store
        .schedule(&claimed, Trigger::now(&claimed.key), false, false)
        .await?;
    assert_eq!(store.acquire_next_triggers(Utc::now(), 10).await?.len(), 1);

    let report = store.recover_after_restart().await?;
    assert_eq!(report.released, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.dropped, 1);

    assert!(store.executing_job_keys().await?.is_empty());
    assert!(store.get_job(&abandoned.key).await?.is_none());

    let mut ready: Vec<_> = store
        .acquire_next_triggers(Utc::now(), 10)
        .await?
        .into_iter()
        .map(|a| a.job.key)
        .collect();
    ready.sort();
    let mut expected = vec![recoverable.key.clone(), claimed.key.clone()];
    expected.sort();
    assert_eq!(ready, expected);
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume_job() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let scan = job("Scan", &[("n", json!(5))]);
    store
        .schedule(&scan, Trigger::now(&scan.key), false, false)
        .await?;

    assert_eq!(store.pause_job(&scan.key).await?, 1);
    assert!(store.acquire_next_triggers(Utc::now(), 1).await?.is_empty());
    assert_eq!(store.waiting_count().await?, 0);

    assert_eq!(store.resume_job(&scan.key).await?, 1);
    assert_eq!(store.waiting_count().await?, 1);
    assert_eq!(store.acquire_next_triggers(Utc::now(), 1).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_and_clear() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let a = job("Scan", &[("n", json!("a"))]);
    let b = job("Scan", &[("n", json!("b"))]);
    for j in [&a, &b] {
        store.schedule(j, Trigger::now(&j.key), false, false).await?;
    }

    assert!(store.delete_job(&a.key).await?);
    assert!(!store.delete_job(&a.key).await?);
    assert!(store.triggers_for_job(&a.key).await?.is_empty());

    store.clear().await?;
    assert!(store.get_job(&b.key).await?.is_none());
    assert_eq!(store.waiting_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_cron_schedule_is_persisted() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let images = job("UpdateImages", &[]);
    let schedule = Schedule::Cron {
        expression: "0 0 3 * * *".to_string(),
    };
    store
        .schedule(&images, Trigger::new(&images.key, schedule.clone()), false, false)
        .await?;

    let triggers = store.triggers_for_job(&images.key).await?;
    assert_eq!(triggers[0].trigger.schedule, schedule);
    Ok(())
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() -> Result<(), Box<dyn Error>> {
    let store = setup_store().await?;
    let images = job("UpdateImages", &[]);
    let trigger = Trigger::new(
        &images.key,
        Schedule::Cron {
            expression: "every day".to_string(),
        },
    );

    let result = store.schedule(&images, trigger, false, false).await;
    assert!(matches!(result, Err(db::DbError::Trigger(_))));
    Ok(())
}

#[tokio::test]
async fn test_heartbeat() -> Result<(), Box<dyn Error>> {
    let store = setup_store_with(StoreOptions::default().with_instance_name("node-a")).await?;
    assert!(store.last_heartbeat().await?.is_none());

    store.heartbeat().await?;
    let last = store.last_heartbeat().await?.ok_or("no heartbeat")?;
    assert!(Utc::now() - last < TimeDelta::seconds(5));
    Ok(())
}

#[tokio::test]
async fn test_schema_bootstrap_is_idempotent() -> Result<(), Box<dyn Error>> {
    let config = StoreConfig::memory();
    let db = connect_db(&config).await?;

    assert!(init_schema(&db, &config).await?);
    assert!(!init_schema(&db, &config).await?);
    Ok(())
}

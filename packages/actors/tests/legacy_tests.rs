mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::builtin::tvdb_update_series;
use actors::{CommandFuture, CommandProcessorHandle, FnCommand, JobError};
use sched_core::{CommandResult, CommandStatus, QueueStateStruct, QueueStatus, WorkCategory};
use tokio::sync::{Notify, broadcast};

use common::eventually;

const WAIT: Duration = Duration::from_secs(5);

fn hashing(path: &str) -> QueueStateStruct {
    QueueStateStruct::new(WorkCategory::HashingFile, vec![path.to_string()])
}

/// A command that finishes once `gate` is notified.
fn gated(id: &str, gate: Arc<Notify>) -> FnCommand<impl Fn() -> CommandFuture + Send + Sync> {
    FnCommand::new(id, hashing(id), move || -> CommandFuture {
        let gate = gate.clone();
        Box::pin(async move {
            gate.notified().await;
            Ok(CommandResult::finished())
        })
    })
}

fn instant(id: &str) -> FnCommand<impl Fn() -> CommandFuture + Send + Sync> {
    FnCommand::new(id, hashing(id), || -> CommandFuture {
        Box::pin(async { Ok(CommandResult::finished()) })
    })
}

async fn next_result(
    results: &mut broadcast::Receiver<(String, CommandResult)>,
) -> Result<(String, CommandResult), Box<dyn Error>> {
    Ok(tokio::time::timeout(WAIT, results.recv()).await??)
}

#[tokio::test]
async fn test_duplicate_ids_are_rejected() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(1).await?;
    let gate = Arc::new(Notify::new());
    let mut results = processor.subscribe_results();

    assert!(processor.enqueue(gated("HashFile_a", gate.clone())).await?);
    // Running.
    assert!(!processor.enqueue(instant("HashFile_a")).await?);

    assert!(processor.enqueue(instant("HashFile_b")).await?);
    // Queued.
    assert!(!processor.enqueue(instant("HashFile_b")).await?);

    gate.notify_one();
    let (first, _) = next_result(&mut results).await?;
    let (second, _) = next_result(&mut results).await?;
    assert_eq!((first.as_str(), second.as_str()), ("HashFile_a", "HashFile_b"));

    // Finished commands can be queued again.
    assert!(processor.enqueue(instant("HashFile_a")).await?);
    processor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_lower_priority_value_runs_first() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(1).await?;
    let mut results = processor.subscribe_results();

    processor.pause()?;
    processor.enqueue(instant("late").with_priority(7)).await?;
    processor.enqueue(instant("urgent").with_priority(1)).await?;
    processor.enqueue(instant("normal").with_priority(5)).await?;
    processor.enqueue(instant("normal_2").with_priority(5)).await?;
    processor.resume()?;

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(next_result(&mut results).await?.0);
    }
    assert_eq!(order, ["urgent", "normal", "normal_2", "late"]);
    processor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_pause_reports_stopping_then_stopped() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(2).await?;
    let mut states = processor.subscribe_queue_state();
    let gate = Arc::new(Notify::new());

    processor.enqueue(gated("HashFile_a", gate.clone())).await?;
    processor.pause()?;

    let state = processor.state().await?;
    assert!(state.paused);
    assert_eq!(state.queue_state.status, QueueStatus::Stopping);
    assert_eq!(state.running, ["HashFile_a"]);

    gate.notify_one();
    let processor_ref = &processor;
    assert!(
        eventually(WAIT, move || async move {
            matches!(processor_ref.state().await, Ok(s) if s.queue_state.status == QueueStatus::Stopped)
        })
        .await
    );

    let mut seen = Vec::new();
    while let Ok(snapshot) = states.try_recv() {
        seen.push(snapshot.status);
    }
    let stopping = seen.iter().position(|s| *s == QueueStatus::Stopping);
    let stopped = seen.iter().position(|s| *s == QueueStatus::Stopped);
    assert!(stopping.is_some() && stopping < stopped);

    // Nothing new starts while paused.
    processor.enqueue(instant("HashFile_b")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.state().await?.queued, ["HashFile_b"]);
    processor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_saturated_tag_is_skipped() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(2).await?;
    let mut results = processor.subscribe_results();
    let gate = Arc::new(Notify::new());

    processor
        .enqueue(gated("TvDB_1", gate.clone()).with_parallel_tag("TvDB", 1))
        .await?;
    processor
        .enqueue(instant("TvDB_2").with_parallel_tag("TvDB", 1))
        .await?;
    processor.enqueue(instant("HashFile_c")).await?;

    // The untagged command runs past the blocked one.
    let (first, _) = next_result(&mut results).await?;
    assert_eq!(first, "HashFile_c");
    assert_eq!(processor.state().await?.queued, ["TvDB_2"]);

    gate.notify_one();
    let (second, _) = next_result(&mut results).await?;
    let (third, _) = next_result(&mut results).await?;
    assert_eq!((second.as_str(), third.as_str()), ("TvDB_1", "TvDB_2"));
    processor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_tvdb_updates_run_four_at_a_time() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(8).await?;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut results = processor.subscribe_results();

    for series in 0..6 {
        let (running, peak) = (running.clone(), peak.clone());
        let command = tvdb_update_series(series, false, move || -> CommandFuture {
            let (running, peak) = (running.clone(), peak.clone());
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(CommandResult::finished())
            })
        });
        assert!(processor.enqueue(command).await?);
    }

    for _ in 0..6 {
        next_result(&mut results).await?;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 4);
    processor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_failures_become_error_results() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(1).await?;
    let mut results = processor.subscribe_results();

    processor
        .enqueue(FnCommand::new("failing", hashing("x"), || -> CommandFuture {
            Box::pin(async { Err(JobError::failed("disk full")) })
        }))
        .await?;
    let (_, result) = next_result(&mut results).await?;
    assert_eq!(result.status, CommandStatus::Error);
    assert_eq!(result.cause.as_deref(), Some("disk full"));

    processor
        .enqueue(FnCommand::new("panicking", hashing("y"), || -> CommandFuture {
            Box::pin(async { panic_with("corrupt header") })
        }))
        .await?;
    let (_, result) = next_result(&mut results).await?;
    assert!(result.is_error());
    assert_eq!(result.cause.as_deref(), Some("corrupt header"));

    // The processor keeps going.
    processor.enqueue(instant("after")).await?;
    let (id, result) = next_result(&mut results).await?;
    assert_eq!(id, "after");
    assert_eq!(result.status, CommandStatus::Finished);
    processor.shutdown()?;
    Ok(())
}

fn panic_with(message: &str) -> Result<CommandResult, JobError> {
    panic!("{}", message.to_string())
}

#[tokio::test]
async fn test_clear_drops_queued_commands() -> Result<(), Box<dyn Error>> {
    let (processor, _handle) = CommandProcessorHandle::start(1).await?;

    processor.pause()?;
    for id in ["a", "b", "c"] {
        processor.enqueue(instant(id)).await?;
    }
    assert_eq!(processor.clear().await?, 3);

    let state = processor.state().await?;
    assert!(state.queued.is_empty());
    // Cleared ids are free again.
    assert!(processor.enqueue(instant("a")).await?);
    processor.shutdown()?;
    Ok(())
}

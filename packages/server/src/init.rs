//! Process initialization for the scheduler host.

use std::time::Duration;

use actors::builtin::{check_network_job, check_trakt_token_job, recurring_jobs, tcp_probe};
use actors::{
    CommandProcessorHandle, DatabaseState, EnvSettings, JobRegistry, NetworkState, SchedulerArgs,
    SchedulerHandle, SettingsProvider, default_filters, start_scheduler,
};
use db::{SchedulerLock, TriggerStore};
use sched_core::QueueStateSnapshot;
use tokio::sync::broadcast;

const PROBE_ADDRS: &[&str] = &["1.1.1.1:53", "8.8.8.8:53"];

/// Everything started by [`init_scheduler`].
pub struct Services {
    pub scheduler: SchedulerHandle,
    pub legacy: CommandProcessorHandle,
}

/// Open the trigger store, start the scheduler and the legacy processor, and
/// reconcile the recurring jobs.
pub async fn init_scheduler(
    provider: &dyn SettingsProvider,
) -> Result<Services, Box<dyn std::error::Error>> {
    tracing::info!("Initializing job scheduler...");

    let settings = provider.scheduler_settings()?;
    let store_config = provider.store_config()?;
    tracing::info!(
        "Using {} store, instance {}, {} worker(s)",
        store_config.backend.as_str(),
        settings.instance_name,
        settings.pool_size
    );

    let network = NetworkState::new(false);
    let database = DatabaseState::new(false);

    let store = TriggerStore::open(&store_config, SchedulerLock::new(), settings.store_options())
        .await?;
    database.set_up(true);

    let probe = tcp_probe(
        PROBE_ADDRS.iter().map(|a| a.to_string()).collect(),
        Duration::from_secs(3),
    );
    let registry = JobRegistry::new()
        .with(check_network_job(network.clone(), probe))
        .with(check_trakt_token_job());
    tracing::info!("Registered job types: {:?}", registry.job_types());

    let legacy_max = settings.legacy_max_concurrency;
    let args = SchedulerArgs::new(store, registry, settings)
        .with_filters(default_filters(&network, &database));
    let (scheduler, _handle) = start_scheduler(args).await?;

    for outcome in scheduler
        .reconciler()
        .reconcile_all(&recurring_jobs())
        .await?
    {
        tracing::debug!("Recurring job reconciled: {:?}", outcome);
    }

    let (legacy, _handle) = CommandProcessorHandle::start(legacy_max).await?;

    log_queue_state("scheduler", scheduler.subscribe_queue_state());
    log_queue_state("legacy", legacy.subscribe_queue_state());

    tracing::info!("Job scheduler initialized");
    Ok(Services { scheduler, legacy })
}

/// Initialize from the process environment.
pub async fn init_from_env() -> Result<Services, Box<dyn std::error::Error>> {
    init_scheduler(&EnvSettings).await
}

fn log_queue_state(name: &'static str, mut rx: broadcast::Receiver<QueueStateSnapshot>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => tracing::info!(
                    "[{}] {:?}: {}",
                    name,
                    snapshot.status,
                    snapshot.description
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("[{}] skipped {} queue state update(s)", name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

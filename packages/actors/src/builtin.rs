//! Job types every scheduler process registers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sched_core::{JobResult, JobSpec, Priority, QueueStateStruct, Schedule, WorkCategory};

use crate::error::JobError;
use crate::filters::NetworkState;
use crate::job::{FnJob, Job, JobContext, JobFuture};
use crate::legacy::{CommandFuture, FnCommand};
use crate::reconciler::RecurringJob;

pub const CHECK_NETWORK_AVAILABILITY: &str = "CheckNetworkAvailability";
pub const CHECK_TRAKT_TOKEN: &str = "CheckTraktToken";

pub type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Reachability probe used by the network check.
pub type NetworkProbe = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

/// Probe that succeeds if any of `addrs` accepts a TCP connection within
/// `timeout`.
pub fn tcp_probe(addrs: Vec<String>, timeout: Duration) -> NetworkProbe {
    let addrs = Arc::new(addrs);
    Arc::new(move || -> ProbeFuture {
        let addrs = addrs.clone();
        Box::pin(async move {
            for addr in addrs.iter() {
                let connect = tokio::net::TcpStream::connect(addr.as_str());
                if let Ok(Ok(_)) = tokio::time::timeout(timeout, connect).await {
                    return true;
                }
            }
            false
        })
    })
}

pub fn check_network_spec() -> JobSpec {
    JobSpec::new(CHECK_NETWORK_AVAILABILITY, WorkCategory::CheckingNetwork)
        .with_group("System")
        .with_concurrency_group(CHECK_NETWORK_AVAILABILITY)
        .with_priority(Priority::RECURRING)
}

/// Probes the network and publishes the result to `network`, which the
/// network filter reads.
pub fn check_network_job(network: NetworkState, probe: NetworkProbe) -> impl Job {
    FnJob::new(check_network_spec(), move |ctx: JobContext| -> JobFuture {
        let network = network.clone();
        let probe = probe.clone();
        Box::pin(async move {
            let up = tokio::select! {
                up = probe() => up,
                _ = ctx.cancelled() => return Err(JobError::Cancelled),
            };

            if network.set_up(up) {
                tracing::info!(
                    "Network is {}",
                    if up { "available" } else { "unavailable" }
                );
            }
            Ok(JobResult::new(if up {
                "Network available"
            } else {
                "Network unavailable"
            }))
        })
    })
}

pub fn check_trakt_token_spec() -> JobSpec {
    JobSpec::new(CHECK_TRAKT_TOKEN, WorkCategory::CheckingTraktToken)
        .with_group("System")
        .with_concurrency_group(CHECK_TRAKT_TOKEN)
        .requires_network()
        .with_priority(Priority::RECURRING)
}

/// Token upkeep for the Trakt integration. No Trakt account is linked in this
/// process, so the run only reports that there was nothing to refresh.
pub fn check_trakt_token_job() -> impl Job {
    FnJob::new(check_trakt_token_spec(), |ctx: JobContext| -> JobFuture {
        Box::pin(async move {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            tracing::debug!("No Trakt account linked; token check skipped");
            Ok(JobResult::new("No Trakt token to refresh"))
        })
    })
}

/// Recurring jobs the server declares at startup.
pub fn recurring_jobs() -> Vec<RecurringJob> {
    vec![
        RecurringJob::new(CHECK_NETWORK_AVAILABILITY, Schedule::every_minutes(30)).replace(false),
        RecurringJob::new(CHECK_TRAKT_TOKEN, Schedule::every_minutes(60)).replace(false),
    ]
}

/// A legacy series refresh. At most four run at once across the
/// `TvDB` tag.
pub fn tvdb_update_series<F>(series_id: i64, force: bool, body: F) -> FnCommand<F>
where
    F: Fn() -> CommandFuture + Send + Sync + 'static,
{
    FnCommand::new(
        format!("CommandRequest_TvDBUpdateSeries_{}", series_id),
        QueueStateStruct::new(
            WorkCategory::GettingTvDbSeries,
            vec![series_id.to_string(), force.to_string()],
        ),
        body,
    )
    .with_priority(6)
    .with_parallel_tag("TvDB", 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::CommandRequest;
    use chrono::Utc;
    use sched_core::{FiredId, JobData, JobDefinition};
    use tokio_util::sync::CancellationToken;

    fn fixed_probe(up: bool) -> NetworkProbe {
        Arc::new(move || -> ProbeFuture { Box::pin(async move { up }) })
    }

    #[tokio::test]
    async fn network_check_updates_state() {
        let network = NetworkState::new(true);
        let job = check_network_job(network.clone(), fixed_probe(false));
        let definition = JobDefinition::for_spec(job.spec(), JobData::new());
        let ctx = JobContext::new(definition, FiredId::new(), Utc::now(), CancellationToken::new());

        let result = job.run(ctx).await.expect("probe runs");
        assert_eq!(result.summary, "Network unavailable");
        assert!(!network.is_up());
    }

    #[test]
    fn recurring_jobs_replace_without_keeping_schedule() {
        let jobs = recurring_jobs();
        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            assert_eq!(job.priority, Priority::RECURRING);
            assert!(job.replace);
            assert!(!job.keep_schedule);
        }
        assert_eq!(jobs[0].job_type, CHECK_NETWORK_AVAILABILITY);
        assert_eq!(jobs[0].schedule, Schedule::every_minutes(30));
        assert_eq!(jobs[1].job_type, CHECK_TRAKT_TOKEN);
        assert_eq!(jobs[1].schedule, Schedule::every_minutes(60));
    }

    #[tokio::test]
    async fn trakt_token_check_is_a_no_op() {
        let job = check_trakt_token_job();
        let definition = JobDefinition::for_spec(job.spec(), JobData::new());
        let ctx = JobContext::new(definition, FiredId::new(), Utc::now(), CancellationToken::new());

        let result = job.run(ctx).await.expect("token check runs");
        assert_eq!(result.summary, "No Trakt token to refresh");
        assert_eq!(job.spec().category, WorkCategory::CheckingTraktToken);
    }

    #[test]
    fn tvdb_command_metadata() {
        let command = tvdb_update_series(81189, true, || -> CommandFuture {
            Box::pin(async { Ok(sched_core::CommandResult::finished()) })
        });
        assert_eq!(command.id(), "CommandRequest_TvDBUpdateSeries_81189");
        assert_eq!(command.parallel_tag(), Some("TvDB"));
        assert_eq!(command.parallel_max(), 4);
        assert_eq!(
            command.pretty_description(),
            "Getting TvDB series info: 81189 - Forced: true"
        );
    }
}

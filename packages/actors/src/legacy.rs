//! Legacy command processor.
//!
//! Runs in-memory command requests outside the trigger store, for the job
//! types that have not moved to it. Commands are taken in (priority, enqueue
//! order); lower priority values go first. A command whose parallel tag is
//! saturated is skipped so the commands behind it can run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use sched_core::{
    ActiveJob, CommandResult, ProcessorSnapshot, QueueStateSnapshot, QueueStateStruct,
};
use tokio::sync::broadcast;

use crate::error::{JobError, SchedulerError, panic_message};
use crate::messages::{CommandMessage, CommandQueueState};
use crate::reporter::QueueStateReporter;

/// Future type for command bodies.
pub type CommandFuture = Pin<Box<dyn Future<Output = Result<CommandResult, JobError>> + Send>>;

/// A unit of work for the legacy processor.
pub trait CommandRequest: Send + Sync + 'static {
    /// Deduplication key. Two commands with the same id never coexist.
    fn id(&self) -> String;

    fn priority(&self) -> i32 {
        5
    }

    fn parallel_tag(&self) -> Option<&str> {
        None
    }

    fn parallel_max(&self) -> usize {
        1
    }

    fn queue_state(&self) -> QueueStateStruct;

    fn pretty_description(&self) -> String {
        self.queue_state().format_message()
    }

    fn run(&self) -> CommandFuture;
}

/// A closure-backed command.
pub struct FnCommand<F>
where
    F: Fn() -> CommandFuture + Send + Sync + 'static,
{
    id: String,
    priority: i32,
    tag: Option<(String, usize)>,
    state: QueueStateStruct,
    body: F,
}

impl<F> FnCommand<F>
where
    F: Fn() -> CommandFuture + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, state: QueueStateStruct, body: F) -> Self {
        Self {
            id: id.into(),
            priority: 5,
            tag: None,
            state,
            body,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parallel_tag(mut self, tag: impl Into<String>, max: usize) -> Self {
        self.tag = Some((tag.into(), max.max(1)));
        self
    }
}

impl<F> CommandRequest for FnCommand<F>
where
    F: Fn() -> CommandFuture + Send + Sync + 'static,
{
    fn id(&self) -> String {
        self.id.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn parallel_tag(&self) -> Option<&str> {
        self.tag.as_ref().map(|(tag, _)| tag.as_str())
    }

    fn parallel_max(&self) -> usize {
        self.tag.as_ref().map_or(1, |(_, max)| *max)
    }

    fn queue_state(&self) -> QueueStateStruct {
        self.state.clone()
    }

    fn run(&self) -> CommandFuture {
        (self.body)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueOrder {
    priority: i32,
    seq: u64,
}

struct RunningCommand {
    tag: Option<String>,
    state: QueueStateStruct,
    order: u64,
}

/// State for the command processor actor.
pub struct CommandProcessorState {
    queue: BTreeMap<QueueOrder, Arc<dyn CommandRequest>>,
    /// Ids of every queued or running command.
    ids: HashSet<String>,
    running: HashMap<String, RunningCommand>,
    tag_counts: HashMap<String, usize>,
    max_concurrency: usize,
    paused: bool,
    seq: u64,
    reporter: QueueStateReporter,
    results: broadcast::Sender<(String, CommandResult)>,
}

impl CommandProcessorState {
    fn tag_has_room(&self, command: &dyn CommandRequest) -> bool {
        match command.parallel_tag() {
            Some(tag) => {
                self.tag_counts.get(tag).copied().unwrap_or(0) < command.parallel_max().max(1)
            }
            None => true,
        }
    }

    /// Next runnable command in queue order, skipping saturated tags.
    fn next_runnable(&self) -> Option<QueueOrder> {
        self.queue
            .iter()
            .find(|(_, command)| self.tag_has_room(command.as_ref()))
            .map(|(order, _)| *order)
    }

    fn dispatch(&mut self, myself: &ActorRef<CommandMessage>) {
        while !self.paused && self.running.len() < self.max_concurrency {
            let Some(order) = self.next_runnable() else {
                break;
            };
            let Some(command) = self.queue.remove(&order) else {
                break;
            };

            let id = command.id();
            let tag = command.parallel_tag().map(str::to_string);
            if let Some(tag) = &tag {
                *self.tag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
            tracing::info!("Running command {}: {}", id, command.pretty_description());

            self.running.insert(
                id.clone(),
                RunningCommand {
                    tag,
                    state: command.queue_state(),
                    order: order.seq,
                },
            );

            let myself = myself.clone();
            tokio::spawn(async move {
                let result = match AssertUnwindSafe(async { command.run().await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(JobError::Cancelled)) => CommandResult::cancelled(),
                    Ok(Err(error)) => CommandResult::error("Command failed", error),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("Command {} panicked: {}", id, message);
                        CommandResult::error("Command panicked", message)
                    }
                };
                let _ = myself.send_message(CommandMessage::Finished { id, result });
            });
        }
    }

    fn snapshot(&self) -> ProcessorSnapshot {
        let active = self
            .running
            .iter()
            .max_by_key(|(_, command)| command.order)
            .map(|(id, command)| ActiveJob {
                id: id.clone(),
                state: command.state.clone(),
            });

        ProcessorSnapshot {
            paused: self.paused,
            executing_count: self.running.len(),
            waiting_count: self.queue.len(),
            active,
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.reporter.publish(&snapshot);
    }

    fn state(&self) -> CommandQueueState {
        CommandQueueState {
            paused: self.paused,
            queued: self.queue.values().map(|c| c.id()).collect(),
            running: self.running.keys().cloned().collect(),
            queue_state: self.reporter.current().clone(),
        }
    }
}

/// Command processor actor arguments.
pub struct CommandProcessorArgs {
    pub max_concurrency: usize,
    pub queue_state: broadcast::Sender<QueueStateSnapshot>,
    pub results: broadcast::Sender<(String, CommandResult)>,
}

/// Actor running the legacy command queue.
pub struct CommandProcessor;

impl Actor for CommandProcessor {
    type Msg = CommandMessage;
    type State = CommandProcessorState;
    type Arguments = CommandProcessorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting command processor (max {} at once)",
            args.max_concurrency
        );

        Ok(CommandProcessorState {
            queue: BTreeMap::new(),
            ids: HashSet::new(),
            running: HashMap::new(),
            tag_counts: HashMap::new(),
            max_concurrency: args.max_concurrency.max(1),
            paused: false,
            seq: 0,
            reporter: QueueStateReporter::with_sender("legacy", args.queue_state),
            results: args.results,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CommandMessage::Enqueue { command, reply } => {
                let id = command.id();
                let accepted = state.ids.insert(id.clone());
                if accepted {
                    state.seq += 1;
                    let order = QueueOrder {
                        priority: command.priority(),
                        seq: state.seq,
                    };
                    state.queue.insert(order, command);
                    tracing::debug!("Queued command {}", id);
                    state.dispatch(&myself);
                } else {
                    tracing::debug!("Command {} is already queued", id);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(accepted);
                }
                state.publish();
            }

            CommandMessage::Finished { id, result } => {
                if let Some(running) = state.running.remove(&id) {
                    if let Some(tag) = running.tag
                        && let Some(count) = state.tag_counts.get_mut(&tag)
                    {
                        *count = count.saturating_sub(1);
                    }
                }
                state.ids.remove(&id);

                if result.is_error() {
                    tracing::warn!(
                        "Command {} failed: {}",
                        id,
                        result.cause.as_deref().unwrap_or("unknown error")
                    );
                } else {
                    tracing::info!("Command {} finished: {:?}", id, result.status);
                }
                let _ = state.results.send((id, result));

                state.dispatch(&myself);
                state.publish();
            }

            CommandMessage::Pause => {
                tracing::info!("Pausing command processor");
                state.paused = true;
                state.publish();
            }

            CommandMessage::Resume => {
                tracing::info!("Resuming command processor");
                state.paused = false;
                state.dispatch(&myself);
                state.publish();
            }

            CommandMessage::Clear { reply } => {
                let dropped = state.queue.len();
                for command in std::mem::take(&mut state.queue).into_values() {
                    state.ids.remove(&command.id());
                }
                tracing::info!("Cleared {} queued command(s)", dropped);
                if let Some(reply) = reply {
                    let _ = reply.send(dropped);
                }
                state.publish();
            }

            CommandMessage::GetState { reply } => {
                let _ = reply.send(state.state());
            }

            CommandMessage::Shutdown => {
                tracing::info!(
                    "Shutting down command processor with {} queued",
                    state.queue.len()
                );
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Handle to a running command processor.
#[derive(Clone)]
pub struct CommandProcessorHandle {
    actor: ActorRef<CommandMessage>,
    queue_state: broadcast::Sender<QueueStateSnapshot>,
    results: broadcast::Sender<(String, CommandResult)>,
}

impl CommandProcessorHandle {
    /// Spawn a processor running at most `max_concurrency` commands at once.
    pub async fn start(
        max_concurrency: usize,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), SchedulerError> {
        let (queue_state, _) = broadcast::channel(256);
        let (results, _) = broadcast::channel(256);
        let args = CommandProcessorArgs {
            max_concurrency,
            queue_state: queue_state.clone(),
            results: results.clone(),
        };

        let (actor, handle) = Actor::spawn(None, CommandProcessor, args).await?;
        Ok((
            Self {
                actor,
                queue_state,
                results,
            },
            handle,
        ))
    }

    /// Queue `command`. Returns `false` if one with the same id is queued or
    /// running.
    pub async fn enqueue<C: CommandRequest>(&self, command: C) -> Result<bool, SchedulerError> {
        self.enqueue_arc(Arc::new(command)).await
    }

    pub async fn enqueue_arc(
        &self,
        command: Arc<dyn CommandRequest>,
    ) -> Result<bool, SchedulerError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| CommandMessage::Enqueue {
                command,
                reply: Some(reply),
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

        match result {
            ractor::rpc::CallResult::Success(accepted) => Ok(accepted),
            _ => Err(SchedulerError::ShutDown),
        }
    }

    pub fn pause(&self) -> Result<(), SchedulerError> {
        Ok(self.actor.send_message(CommandMessage::Pause)?)
    }

    pub fn resume(&self) -> Result<(), SchedulerError> {
        Ok(self.actor.send_message(CommandMessage::Resume)?)
    }

    /// Drop every queued command; running ones finish.
    pub async fn clear(&self) -> Result<usize, SchedulerError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| CommandMessage::Clear { reply: Some(reply) },
            Some(Duration::from_secs(5)),
        )
        .await?;

        match result {
            ractor::rpc::CallResult::Success(dropped) => Ok(dropped),
            _ => Err(SchedulerError::ShutDown),
        }
    }

    pub async fn state(&self) -> Result<CommandQueueState, SchedulerError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| CommandMessage::GetState { reply },
            Some(Duration::from_secs(5)),
        )
        .await?;

        match result {
            ractor::rpc::CallResult::Success(state) => Ok(state),
            _ => Err(SchedulerError::ShutDown),
        }
    }

    pub fn subscribe_queue_state(&self) -> broadcast::Receiver<QueueStateSnapshot> {
        self.queue_state.subscribe()
    }

    /// Results of finished commands, keyed by command id.
    pub fn subscribe_results(&self) -> broadcast::Receiver<(String, CommandResult)> {
        self.results.subscribe()
    }

    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        Ok(self.actor.send_message(CommandMessage::Shutdown)?)
    }
}

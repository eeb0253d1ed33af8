//! Derived, non-persisted queue status for observability.
//!
//! A processor exposes its live counters as a [`ProcessorSnapshot`]; change
//! notifications carry the same facts as [`QueueStateEventArgs`]. Both are
//! reduced to a [`QueueStateSnapshot`] by the same rule, so a subscriber sees
//! the same status and description no matter which one it was built from.

use serde::{Deserialize, Serialize};

/// What kind of work the processor is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkCategory {
    #[default]
    Idle,
    CheckingNetwork,
    CheckingTraktToken,
    FetchingSeries,
    GettingTvDbSeries,
    SyncingTrakt,
    HashingFile,
    ScanningFolder,
    UpdatingImages,
    /// Free-form; the first parameter is the whole message.
    Generic,
}

impl WorkCategory {
    /// Message template. `{n}` is replaced by the n-th parameter.
    pub fn template(&self) -> &'static str {
        match self {
            WorkCategory::Idle => "Idle",
            WorkCategory::CheckingNetwork => "Checking network availability",
            WorkCategory::CheckingTraktToken => "Checking Trakt token",
            WorkCategory::FetchingSeries => "Fetching series info: {0}",
            WorkCategory::GettingTvDbSeries => "Getting TvDB series info: {0} - Forced: {1}",
            WorkCategory::SyncingTrakt => "Syncing Trakt episode history: {0}",
            WorkCategory::HashingFile => "Hashing file: {0}",
            WorkCategory::ScanningFolder => "Scanning folder: {0}",
            WorkCategory::UpdatingImages => "Updating images: {0}",
            WorkCategory::Generic => "{0}",
        }
    }
}

/// A work category together with the parameters for its template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateStruct {
    pub category: WorkCategory,
    #[serde(default)]
    pub params: Vec<String>,
}

impl QueueStateStruct {
    pub fn new(category: WorkCategory, params: Vec<String>) -> Self {
        Self { category, params }
    }

    pub fn idle() -> Self {
        Self::default()
    }

    /// Render the category template with this state's parameters.
    ///
    /// Missing parameters render as empty strings.
    pub fn format_message(&self) -> String {
        let template = self.category.template();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => match after[..close].parse::<usize>() {
                    Ok(index) => {
                        if let Some(param) = self.params.get(index) {
                            out.push_str(param);
                        }
                        rest = &after[close + 1..];
                    }
                    Err(_) => {
                        out.push('{');
                        rest = after;
                    }
                },
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Coarse processor status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    Idle,
    Waiting,
    Running,
    Stopping,
    Stopped,
}

impl QueueStatus {
    /// Reduce processor facts to a status.
    ///
    /// A paused processor is `Stopping` until its in-flight work drains. An
    /// unpaused processor with an idle category is `Waiting` when work is
    /// queued behind a deferral, otherwise `Idle`.
    pub fn derive(
        paused: bool,
        is_running: bool,
        category: WorkCategory,
        waiting_count: usize,
    ) -> Self {
        if paused {
            if is_running {
                QueueStatus::Stopping
            } else {
                QueueStatus::Stopped
            }
        } else if category == WorkCategory::Idle {
            if waiting_count > 0 {
                QueueStatus::Waiting
            } else {
                QueueStatus::Idle
            }
        } else {
            QueueStatus::Running
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Idle => "Idle",
            QueueStatus::Waiting => "Waiting",
            QueueStatus::Running => "Running",
            QueueStatus::Stopping => "Stopping",
            QueueStatus::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The job a processor is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub id: String,
    pub state: QueueStateStruct,
}

/// Live counters read from a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSnapshot {
    pub paused: bool,
    pub executing_count: usize,
    pub waiting_count: usize,
    /// Most recently started job still running, if any.
    pub active: Option<ActiveJob>,
}

impl ProcessorSnapshot {
    /// Capture these counters as a change-notification payload.
    pub fn to_event_args(&self) -> QueueStateEventArgs {
        QueueStateEventArgs {
            queue_state: self
                .active
                .as_ref()
                .map(|a| a.state.clone())
                .unwrap_or_default(),
            command_request_id: self.active.as_ref().map(|a| a.id.clone()),
            is_paused: self.paused,
            is_running: self.executing_count > 0,
            current_count: self.waiting_count,
        }
    }
}

/// Payload of a queue-state change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateEventArgs {
    pub queue_state: QueueStateStruct,
    pub command_request_id: Option<String>,
    pub is_paused: bool,
    pub is_running: bool,
    pub current_count: usize,
}

/// The observable queue state pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateSnapshot {
    pub state: WorkCategory,
    pub description: String,
    /// Lets subscribers notice a job-to-job transition without diffing text.
    pub current_job_id: Option<String>,
    pub status: QueueStatus,
}

impl QueueStateSnapshot {
    fn derive(
        state: &QueueStateStruct,
        current_job_id: Option<String>,
        paused: bool,
        is_running: bool,
        waiting_count: usize,
    ) -> Self {
        Self {
            state: state.category,
            description: state.format_message(),
            current_job_id,
            status: QueueStatus::derive(paused, is_running, state.category, waiting_count),
        }
    }

    pub fn from_processor(processor: &ProcessorSnapshot) -> Self {
        let idle = QueueStateStruct::idle();
        let state = processor.active.as_ref().map_or(&idle, |a| &a.state);
        Self::derive(
            state,
            processor.active.as_ref().map(|a| a.id.clone()),
            processor.paused,
            processor.executing_count > 0,
            processor.waiting_count,
        )
    }

    pub fn from_event(event: &QueueStateEventArgs) -> Self {
        Self::derive(
            &event.queue_state,
            event.command_request_id.clone(),
            event.is_paused,
            event.is_running,
            event.current_count,
        )
    }

    pub fn idle() -> Self {
        Self::from_processor(&ProcessorSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn active(category: WorkCategory, params: &[&str]) -> ActiveJob {
        ActiveJob {
            id: "job-1".to_string(),
            state: QueueStateStruct::new(
                category,
                params.iter().map(|p| p.to_string()).collect(),
            ),
        }
    }

    #[test]
    fn status_table() {
        use QueueStatus::*;
        use WorkCategory as C;

        assert_eq!(QueueStatus::derive(true, true, C::HashingFile, 3), Stopping);
        assert_eq!(QueueStatus::derive(true, false, C::Idle, 3), Stopped);
        assert_eq!(QueueStatus::derive(false, false, C::Idle, 2), Waiting);
        assert_eq!(QueueStatus::derive(false, false, C::Idle, 0), Idle);
        assert_eq!(QueueStatus::derive(false, true, C::HashingFile, 0), Running);
    }

    #[test]
    fn formats_positional_parameters() {
        let state = QueueStateStruct::new(
            WorkCategory::GettingTvDbSeries,
            vec!["Cowboy Bebop (76885)".to_string(), "true".to_string()],
        );
        assert_eq!(
            state.format_message(),
            "Getting TvDB series info: Cowboy Bebop (76885) - Forced: true"
        );
    }

    #[test]
    fn missing_parameters_render_empty() {
        let state = QueueStateStruct::new(WorkCategory::GettingTvDbSeries, vec!["X".into()]);
        assert_eq!(state.format_message(), "Getting TvDB series info: X - Forced: ");
    }

    #[test]
    fn idle_snapshot() {
        let snapshot = QueueStateSnapshot::idle();
        assert_eq!(snapshot.status, QueueStatus::Idle);
        assert_eq!(snapshot.description, "Idle");
        assert_eq!(snapshot.current_job_id, None);
    }

    #[test]
    fn paused_with_running_job_is_stopping() {
        let processor = ProcessorSnapshot {
            paused: true,
            executing_count: 1,
            waiting_count: 4,
            active: Some(active(WorkCategory::HashingFile, &["a.mkv"])),
        };
        let snapshot = QueueStateSnapshot::from_processor(&processor);
        assert_eq!(snapshot.status, QueueStatus::Stopping);
        assert_eq!(snapshot.description, "Hashing file: a.mkv");
        assert_eq!(snapshot.current_job_id.as_deref(), Some("job-1"));
    }

    fn category() -> impl Strategy<Value = WorkCategory> {
        prop_oneof![
            Just(WorkCategory::Idle),
            Just(WorkCategory::CheckingNetwork),
            Just(WorkCategory::FetchingSeries),
            Just(WorkCategory::GettingTvDbSeries),
            Just(WorkCategory::HashingFile),
            Just(WorkCategory::Generic),
        ]
    }

    proptest! {
        #[test]
        fn processor_and_event_derivations_agree(
            paused in any::<bool>(),
            executing in 0usize..4,
            waiting in 0usize..10,
            category in category(),
            params in proptest::collection::vec("[a-z ]{0,8}", 0..3),
        ) {
            let active = (executing > 0).then(|| ActiveJob {
                id: "cmd".to_string(),
                state: QueueStateStruct::new(category, params.clone()),
            });
            let processor = ProcessorSnapshot {
                paused,
                executing_count: executing,
                waiting_count: waiting,
                active,
            };

            let live = QueueStateSnapshot::from_processor(&processor);
            let captured = QueueStateSnapshot::from_event(&processor.to_event_args());
            prop_assert_eq!(&live.status, &captured.status);
            prop_assert_eq!(&live.description, &captured.description);
            prop_assert_eq!(live, QueueStateSnapshot::from_processor(&processor));
        }
    }
}

//! Job domain types: identity, stored definitions and static job metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::WorkCategory;

/// Opaque key/value data handed to a job body.
///
/// Backed by an ordered map, so key iteration is stable and identity
/// generation is deterministic.
pub type JobData = serde_json::Map<String, Value>;

/// Identity of a stored job: a name unique within a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Derive the identity of a job from its type and data.
    ///
    /// Two producers asking for the same job type with the same data get the
    /// same key, which is what makes scheduling idempotent. The data is
    /// rendered as canonical JSON, so string and number values, and values
    /// containing separators, never collide.
    pub fn generate(job_type: &str, group: &str, data: &JobData) -> Self {
        if data.is_empty() {
            return Self::new(job_type, group);
        }

        let params = canonical(&Value::Object(data.clone()));
        Self::new(format!("{job_type}_{params}"), group)
    }
}

/// `value` with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Unique identifier for one execution of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FiredId(pub Ulid);

impl FiredId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for FiredId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FiredId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trigger priority. Higher values are dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const DEFAULT: Priority = Priority(5);
    /// Used by "start now" requests.
    pub const NOW: Priority = Priority(10);
    /// Recurring jobs scheduled at startup preempt any accumulated backlog.
    pub const RECURRING: Priority = Priority(20);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote services guarded by their own rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteService {
    /// Bulk metadata fetches over HTTP.
    Http,
    /// Incremental updates over the UDP protocol.
    Udp,
}

impl RemoteService {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteService::Http => "http",
            RemoteService::Udp => "udp",
        }
    }
}

/// A stored unit of work. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Registered job type, used to find the job body.
    pub job_type: String,
    #[serde(default)]
    pub data: JobData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Durable jobs outlive their last trigger.
    #[serde(default)]
    pub durable: bool,
    /// Re-run from the start if the process died while it was executing.
    #[serde(default)]
    pub requests_recovery: bool,
}

impl JobDefinition {
    /// Create a definition with an identity generated from type and data.
    pub fn new(job_type: impl Into<String>, group: impl Into<String>, data: JobData) -> Self {
        let job_type = job_type.into();
        let key = JobKey::generate(&job_type, &group.into(), &data);
        Self {
            key,
            job_type,
            data,
            description: None,
            durable: false,
            requests_recovery: false,
        }
    }

    /// Create a definition for a job spec, inheriting its group and recovery flag.
    pub fn for_spec(spec: &JobSpec, data: JobData) -> Self {
        Self::new(&spec.job_type, &spec.group, data).with_recovery(spec.recoverable)
    }

    pub fn with_identity(mut self, key: JobKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }
}

/// Static metadata a job type declares once, at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    /// Key group stored jobs of this type are filed under.
    pub group: String,
    /// Hard mutual exclusion: at most one running job of this class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,
    /// Soft capacity: up to `parallel_max` running jobs share this tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tag: Option<String>,
    pub parallel_max: usize,
    pub priority: Priority,
    #[serde(default)]
    pub requires_network: bool,
    #[serde(default)]
    pub requires_database: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<RemoteService>,
    #[serde(default)]
    pub recoverable: bool,
    pub category: WorkCategory,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, category: WorkCategory) -> Self {
        Self {
            job_type: job_type.into(),
            group: "default".to_string(),
            concurrency_group: None,
            parallel_tag: None,
            parallel_max: 1,
            priority: Priority::default(),
            requires_network: false,
            requires_database: false,
            rate_limited: None,
            recoverable: false,
            category,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_concurrency_group(mut self, class: impl Into<String>) -> Self {
        self.concurrency_group = Some(class.into());
        self
    }

    /// Share a capacity of `max` concurrent executions with every job carrying `tag`.
    pub fn with_parallel_tag(mut self, tag: impl Into<String>, max: usize) -> Self {
        self.parallel_tag = Some(tag.into());
        self.parallel_max = max.max(1);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn requires_network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    pub fn requires_database(mut self) -> Self {
        self.requires_database = true;
        self
    }

    pub fn rate_limited(mut self, service: RemoteService) -> Self {
        self.rate_limited = Some(service);
        self
    }

    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Human-readable summary of the result.
    pub summary: String,
    /// Optional structured output data as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl JobResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            output: None,
        }
    }

    pub fn with_output(summary: impl Into<String>, output: Value) -> Self {
        Self {
            summary: summary.into(),
            output: Some(output),
        }
    }
}

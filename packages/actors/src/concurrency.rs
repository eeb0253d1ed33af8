//! Concurrency groups.
//!
//! A job spec may name a concurrency class (at most one running job across
//! every type in the class) and a parallel tag (up to `parallel_max` running
//! jobs sharing the tag). Slots are taken with atomic compare-and-swap and
//! given back when the [`ConcurrencyPermit`] is dropped, so a job that
//! panics or is cancelled cannot leak capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sched_core::JobSpec;

/// Why a job could not be admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityDenied {
    #[error("concurrency group {0} is busy")]
    ClassBusy(String),

    #[error("parallel tag {tag} is at its limit of {max}")]
    TagFull { tag: String, max: usize },
}

#[derive(Default)]
struct Groups {
    classes: Mutex<HashMap<String, Arc<AtomicBool>>>,
    tags: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

/// Shared capacity counters for every running job.
#[derive(Clone, Default)]
pub struct ConcurrencyGroups {
    inner: Arc<Groups>,
}

impl std::fmt::Debug for ConcurrencyGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGroups").finish_non_exhaustive()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_flag(&self, class: &str) -> Arc<AtomicBool> {
        locked(&self.inner.classes)
            .entry(class.to_string())
            .or_default()
            .clone()
    }

    fn tag_counter(&self, tag: &str) -> Arc<AtomicUsize> {
        locked(&self.inner.tags)
            .entry(tag.to_string())
            .or_default()
            .clone()
    }

    /// Take a slot in every group `spec` belongs to, or none at all.
    pub fn try_acquire(&self, spec: &JobSpec) -> Result<ConcurrencyPermit, CapacityDenied> {
        let class = match &spec.concurrency_group {
            Some(name) => {
                let flag = self.class_flag(name);
                if flag
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(CapacityDenied::ClassBusy(name.clone()));
                }
                Some((name.clone(), flag))
            }
            None => None,
        };

        let tag = match &spec.parallel_tag {
            Some(name) => {
                let max = spec.parallel_max.max(1);
                let counter = self.tag_counter(name);
                let taken = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                });
                if taken.is_err() {
                    if let Some((_, flag)) = &class {
                        flag.store(false, Ordering::Release);
                    }
                    return Err(CapacityDenied::TagFull {
                        tag: name.clone(),
                        max,
                    });
                }
                Some((name.clone(), counter))
            }
            None => None,
        };

        Ok(ConcurrencyPermit { class, tag })
    }

    /// Running jobs holding a slot of `tag`.
    pub fn active_count(&self, tag: &str) -> usize {
        locked(&self.inner.tags)
            .get(tag)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Whether a job of `class` is running.
    pub fn is_class_busy(&self, class: &str) -> bool {
        locked(&self.inner.classes)
            .get(class)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }
}

/// Capacity held by one running job.
pub struct ConcurrencyPermit {
    class: Option<(String, Arc<AtomicBool>)>,
    tag: Option<(String, Arc<AtomicUsize>)>,
}

impl ConcurrencyPermit {
    pub fn class(&self) -> Option<&str> {
        self.class.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_ref().map(|(name, _)| name.as_str())
    }
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("class", &self.class())
            .field("tag", &self.tag())
            .finish()
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some((_, flag)) = &self.class {
            flag.store(false, Ordering::Release);
        }
        if let Some((_, counter)) = &self.tag {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

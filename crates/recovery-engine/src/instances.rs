//! Weak instance tracking for snapshot stamping.
//!
//! Instances are held through [`Weak`] slots addressed by a generational
//! [`InstanceHandle`]. Dropped instances stop counting immediately, but their
//! slots are only reclaimed by an explicit [`InstanceTracker::purge_dead`]
//! sweep, which the engine runs alongside snapshot cleanup. A reclaimed slot
//! bumps its generation so stale handles can never address a new occupant.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

use crate::ports::InstanceRegistry;

/// Address of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub index: usize,
    pub generation: u64,
}

struct Slot {
    generation: u64,
    entry: Option<(String, Weak<dyn Any + Send + Sync>)>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// In-process [`InstanceRegistry`] backed by weak references.
#[derive(Default)]
pub struct InstanceTracker {
    inner: Mutex<Slots>,
}

impl InstanceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `instance` as belonging to `unit_id`.
    pub fn track<T>(&self, unit_id: &str, instance: &Arc<T>) -> InstanceHandle
    where
        T: Any + Send + Sync,
    {
        let erased: Arc<dyn Any + Send + Sync> = instance.clone();
        let weak = Arc::downgrade(&erased);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = Some((unit_id.to_string(), weak));
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index];
            slot.entry = entry;
            InstanceHandle {
                index,
                generation: slot.generation,
            }
        } else {
            inner.slots.push(Slot {
                generation: 0,
                entry,
            });
            InstanceHandle {
                index: inner.slots.len() - 1,
                generation: 0,
            }
        }
    }

    /// Stop tracking an instance. Stale handles are ignored.
    pub fn untrack(&self, handle: InstanceHandle) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let released = match inner.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation && slot.entry.is_some() => {
                slot.entry = None;
                slot.generation += 1;
                true
            }
            _ => false,
        };
        if released {
            inner.free.push(handle.index);
        }
        released
    }

    /// Whether `handle` still addresses a live instance.
    pub fn is_alive(&self, handle: InstanceHandle) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.slots.get(handle.index).is_some_and(|slot| {
            slot.generation == handle.generation
                && slot
                    .entry
                    .as_ref()
                    .is_some_and(|(_, weak)| weak.strong_count() > 0)
        })
    }

    /// Number of occupied slots, dead or alive.
    pub fn slot_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

impl InstanceRegistry for InstanceTracker {
    fn count_instances(&self, unit_id: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|(unit, weak)| unit == unit_id && weak.strong_count() > 0)
            .count()
    }

    fn purge_dead(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut freed = Vec::new();

        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let dead = slot
                .entry
                .as_ref()
                .is_some_and(|(_, weak)| weak.strong_count() == 0);
            if dead {
                slot.entry = None;
                slot.generation += 1;
                freed.push(index);
            }
        }

        let purged = freed.len();
        inner.free.extend(freed);
        if purged > 0 {
            debug!(purged = purged, "Purged dead instance slots");
        }
        purged
    }
}

/// Per-unit counts without instance tracking.
#[derive(Debug, Default)]
pub struct StaticInstanceCounts {
    counts: Mutex<HashMap<String, usize>>,
}

impl StaticInstanceCounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, unit_id: &str, count: usize) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit_id.to_string(), count);
    }
}

impl InstanceRegistry for StaticInstanceCounts {
    fn count_instances(&self, unit_id: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit_id)
            .copied()
            .unwrap_or(0)
    }
}

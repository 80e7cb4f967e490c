//! Point-in-time captures of a unit, taken before a risky operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::error::{EngineError, EngineResult};
use crate::ports::InstanceRegistry;
use crate::rollback::RollbackOperationKind;

/// Restorable state of a unit. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub unit_id: String,
    /// Live instances reported by the registry at capture time
    pub instance_count: usize,
    /// Implementation in place when the snapshot was taken, if captured
    pub prior_implementation: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    #[must_use]
    pub fn has_implementation(&self) -> bool {
        self.prior_implementation.is_some()
    }

    /// Age relative to `now`; zero for snapshots stamped in the future.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// Result of a retention sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed_count: usize,
    /// Expired snapshots kept because a rollback was using them
    pub skipped_pinned: usize,
    pub duration: Duration,
}

type PinCounts = Arc<Mutex<HashMap<String, usize>>>;

/// Keeps a snapshot out of sweeps and invalidation while held.
#[derive(Debug)]
pub struct SnapshotPin {
    snapshot_id: String,
    pins: PinCounts,
}

impl SnapshotPin {
    #[must_use]
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pins.get_mut(&self.snapshot_id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.snapshot_id);
            }
        }
    }
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, Arc<Snapshot>>,
    /// Snapshot ids per unit in creation order; the last one is the latest
    by_unit: HashMap<String, Vec<String>>,
    /// Operations that already restored a snapshot, dropped with it
    restored: HashMap<String, HashSet<RollbackOperationKind>>,
}

impl Entries {
    fn insert(&mut self, snapshot: Arc<Snapshot>) {
        self.by_unit
            .entry(snapshot.unit_id.clone())
            .or_default()
            .push(snapshot.snapshot_id.clone());
        self.by_id.insert(snapshot.snapshot_id.clone(), snapshot);
    }

    fn latest(&self, unit_id: &str) -> Option<&Arc<Snapshot>> {
        self.by_unit
            .get(unit_id)?
            .last()
            .and_then(|id| self.by_id.get(id))
    }

    /// Remove a snapshot and its restore markers.
    ///
    /// The unit index still lists the id until [`Entries::compact`] runs.
    fn take(&mut self, snapshot_id: &str) -> Option<Arc<Snapshot>> {
        self.restored.remove(snapshot_id);
        self.by_id.remove(snapshot_id)
    }

    fn compact(&mut self, unit_id: &str) {
        let by_id = &self.by_id;
        if let Some(ids) = self.by_unit.get_mut(unit_id) {
            ids.retain(|id| by_id.contains_key(id));
            if ids.is_empty() {
                self.by_unit.remove(unit_id);
            }
        }
    }
}

/// Owns every snapshot's lifetime.
pub struct SnapshotStore {
    entries: RwLock<Entries>,
    pins: PinCounts,
    registry: Arc<dyn InstanceRegistry>,
    audit: Arc<AuditTrail>,
}

impl SnapshotStore {
    pub fn new(registry: Arc<dyn InstanceRegistry>, audit: Arc<AuditTrail>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            pins: Arc::new(Mutex::new(HashMap::new())),
            registry,
            audit,
        }
    }

    /// Capture the unit's current instance count.
    pub async fn create(&self, unit_id: &str) -> EngineResult<Arc<Snapshot>> {
        self.insert(unit_id, None).await
    }

    /// Capture the instance count together with the current implementation.
    pub async fn create_with_implementation(
        &self,
        unit_id: &str,
        implementation: Vec<u8>,
    ) -> EngineResult<Arc<Snapshot>> {
        self.insert(unit_id, Some(implementation)).await
    }

    async fn insert(
        &self,
        unit_id: &str,
        prior_implementation: Option<Vec<u8>>,
    ) -> EngineResult<Arc<Snapshot>> {
        if unit_id.trim().is_empty() {
            return Err(EngineError::EmptyUnitId);
        }

        let snapshot = Arc::new(Snapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            unit_id: unit_id.to_string(),
            instance_count: self.registry.count_instances(unit_id),
            prior_implementation,
            created_at: Utc::now(),
        });

        {
            let mut entries = self.entries.write().await;
            entries.insert(Arc::clone(&snapshot));
        }

        info!(
            snapshot_id = %snapshot.snapshot_id,
            unit_id = %snapshot.unit_id,
            instance_count = snapshot.instance_count,
            has_implementation = snapshot.has_implementation(),
            "Snapshot created"
        );
        self.audit
            .record_snapshot_created(
                &snapshot.snapshot_id,
                &snapshot.unit_id,
                snapshot.has_implementation(),
            )
            .await;

        Ok(snapshot)
    }

    pub async fn get(&self, snapshot_id: &str) -> EngineResult<Arc<Snapshot>> {
        self.entries
            .read()
            .await
            .by_id
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| EngineError::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })
    }

    /// Most recently created snapshot of a unit.
    pub async fn latest_for_unit(&self, unit_id: &str) -> Option<Arc<Snapshot>> {
        self.entries.read().await.latest(unit_id).cloned()
    }

    /// Whether `kind` has already restored this snapshot successfully.
    pub(crate) async fn is_restored(&self, snapshot_id: &str, kind: RollbackOperationKind) -> bool {
        self.entries
            .read()
            .await
            .restored
            .get(snapshot_id)
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    /// Remember a successful restore for as long as the snapshot is stored.
    pub(crate) async fn mark_restored(&self, snapshot_id: &str, kind: RollbackOperationKind) {
        let mut entries = self.entries.write().await;
        if entries.by_id.contains_key(snapshot_id) {
            entries
                .restored
                .entry(snapshot_id.to_string())
                .or_default()
                .insert(kind);
        }
    }

    pub fn pin(&self, snapshot: &Snapshot) -> SnapshotPin {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        *pins.entry(snapshot.snapshot_id.clone()).or_insert(0) += 1;
        SnapshotPin {
            snapshot_id: snapshot.snapshot_id.clone(),
            pins: Arc::clone(&self.pins),
        }
    }

    pub fn is_pinned(&self, snapshot_id: &str) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(snapshot_id)
    }

    /// Remove a snapshot that is no longer needed.
    ///
    /// Returns `Ok(false)` when the snapshot is pinned by an in-flight rollback.
    pub async fn invalidate(&self, snapshot_id: &str) -> EngineResult<bool> {
        let mut entries = self.entries.write().await;
        if !entries.by_id.contains_key(snapshot_id) {
            return Err(EngineError::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            });
        }
        if self.is_pinned(snapshot_id) {
            debug!(snapshot_id = %snapshot_id, "Snapshot pinned, not invalidated");
            return Ok(false);
        }
        if let Some(removed) = entries.take(snapshot_id) {
            entries.compact(&removed.unit_id);
        }
        debug!(snapshot_id = %snapshot_id, "Snapshot invalidated");
        Ok(true)
    }

    /// Remove every unpinned snapshot older than `max_age`.
    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        let started = Instant::now();
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        let expired: Vec<String> = entries
            .by_id
            .values()
            .filter(|s| s.age_at(now) > max_age)
            .map(|s| s.snapshot_id.clone())
            .collect();

        let mut removed_count = 0;
        let mut skipped_pinned = 0;
        let mut touched_units = HashSet::new();
        for snapshot_id in expired {
            if self.is_pinned(&snapshot_id) {
                skipped_pinned += 1;
                continue;
            }
            if let Some(removed) = entries.take(&snapshot_id) {
                touched_units.insert(removed.unit_id.clone());
                removed_count += 1;
            }
        }
        for unit_id in &touched_units {
            entries.compact(unit_id);
        }
        drop(entries);

        let duration = started.elapsed();
        info!(
            removed = removed_count,
            skipped_pinned = skipped_pinned,
            max_age_secs = max_age.as_secs(),
            "Snapshot sweep finished"
        );
        SweepReport {
            removed_count,
            skipped_pinned,
            duration,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::StaticInstanceCounts;

    fn store() -> (SnapshotStore, Arc<AuditTrail>) {
        let counts = Arc::new(StaticInstanceCounts::new());
        counts.set("U1", 3);
        let audit = Arc::new(AuditTrail::new());
        (SnapshotStore::new(counts, Arc::clone(&audit)), audit)
    }

    #[tokio::test]
    async fn test_create_stamps_instance_count() {
        let (store, audit) = store();
        let snapshot = store.create("U1").await.unwrap();

        assert_eq!(snapshot.instance_count, 3);
        assert!(!snapshot.has_implementation());
        assert_eq!(store.get(&snapshot.snapshot_id).await.unwrap(), snapshot);
        assert_eq!(audit.len().await, 1);
        assert_eq!(audit.statistics().total_operations, 0);
    }

    #[tokio::test]
    async fn test_empty_unit_is_rejected() {
        let (store, _) = store();
        assert!(matches!(store.create(" ").await, Err(EngineError::EmptyUnitId)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_not_found() {
        let (store, _) = store();
        assert!(matches!(
            store.get("nope").await,
            Err(EngineError::SnapshotNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_latest_tracks_newest_and_falls_back() {
        let (store, _) = store();
        let first = store.create("U1").await.unwrap();
        let second = store
            .create_with_implementation("U1", b"v1".to_vec())
            .await
            .unwrap();

        let latest = store.latest_for_unit("U1").await.unwrap();
        assert_eq!(latest.snapshot_id, second.snapshot_id);

        assert!(store.invalidate(&second.snapshot_id).await.unwrap());
        let latest = store.latest_for_unit("U1").await.unwrap();
        assert_eq!(latest.snapshot_id, first.snapshot_id);

        assert!(store.invalidate(&first.snapshot_id).await.unwrap());
        assert!(store.latest_for_unit("U1").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (store, _) = store();
        store.create("U1").await.unwrap();
        store.create("U2").await.unwrap();

        let report = store.sweep(Duration::from_secs(60)).await;
        assert_eq!(report.removed_count, 0);
        assert_eq!(store.len().await, 2);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = store.sweep(Duration::ZERO).await;
        assert_eq!(report.removed_count, 2);
        assert!(store.is_empty().await);

        let report = store.sweep(Duration::ZERO).await;
        assert_eq!(report.removed_count, 0);
    }

    #[tokio::test]
    async fn test_pinned_snapshot_survives() {
        let (store, _) = store();
        let snapshot = store.create("U1").await.unwrap();
        let pin = store.pin(&snapshot);
        let second_pin = store.pin(&snapshot);
        assert_eq!(pin.snapshot_id(), snapshot.snapshot_id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = store.sweep(Duration::ZERO).await;
        assert_eq!(report.removed_count, 0);
        assert_eq!(report.skipped_pinned, 1);
        assert!(!store.invalidate(&snapshot.snapshot_id).await.unwrap());

        drop(pin);
        assert!(store.is_pinned(&snapshot.snapshot_id));
        drop(second_pin);
        assert!(!store.is_pinned(&snapshot.snapshot_id));

        let report = store.sweep(Duration::ZERO).await;
        assert_eq!(report.removed_count, 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_newer_snapshot_as_latest() {
        let (store, _) = store();
        let old = store.create("U1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = store.create("U1").await.unwrap();

        let report = store.sweep(Duration::from_millis(20)).await;
        assert_eq!(report.removed_count, 1);
        assert!(store.get(&old.snapshot_id).await.is_err());
        let latest = store.latest_for_unit("U1").await.unwrap();
        assert_eq!(latest.snapshot_id, fresh.snapshot_id);
        assert_eq!(store.entries.read().await.by_unit["U1"], vec![fresh.snapshot_id.clone()]);
    }

    #[tokio::test]
    async fn test_restore_markers_leave_with_their_snapshot() {
        let (store, _) = store();
        let swept = store.create("U1").await.unwrap();
        let invalidated = store.create("U2").await.unwrap();
        let kind = RollbackOperationKind::FullRestore;

        store.mark_restored(&swept.snapshot_id, kind).await;
        store.mark_restored(&invalidated.snapshot_id, kind).await;
        assert!(store.is_restored(&swept.snapshot_id, kind).await);
        let other = RollbackOperationKind::InstanceStateRestore;
        assert!(!store.is_restored(&swept.snapshot_id, other).await);

        assert!(store.invalidate(&invalidated.snapshot_id).await.unwrap());
        assert!(!store.is_restored(&invalidated.snapshot_id, kind).await);

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.sweep(Duration::ZERO).await;
        assert!(!store.is_restored(&swept.snapshot_id, kind).await);

        let entries = store.entries.read().await;
        assert!(entries.restored.is_empty());
        assert!(entries.by_unit.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_never_marked() {
        let (store, _) = store();
        let snapshot = store.create("U1").await.unwrap();
        assert!(store.invalidate(&snapshot.snapshot_id).await.unwrap());

        store
            .mark_restored(&snapshot.snapshot_id, RollbackOperationKind::FullRestore)
            .await;
        assert!(store.entries.read().await.restored.is_empty());
    }
}

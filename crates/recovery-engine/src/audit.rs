//! Append-only, hash-chained audit trail of snapshot and rollback events.
//!
//! Appends are serialised by a single lock so entry order matches the order
//! events were recorded. Each entry carries a SHA-1 digest over its own fields
//! and the previous entry's digest; [`verify_chain`] recomputes the chain and
//! reports the first entry that no longer matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::rollback::RollbackOperationKind;
use crate::stats::{OperationCounters, RecoveryStatistics};

const GENESIS_DIGEST: &str = "0000000000000000000000000000000000000000";

/// Type of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryKind {
    SnapshotCreated,
    RollbackPerformed,
    RollbackFailed,
    CleanupPerformed,
}

impl AuditEntryKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotCreated => "snapshot_created",
            Self::RollbackPerformed => "rollback_performed",
            Self::RollbackFailed => "rollback_failed",
            Self::CleanupPerformed => "cleanup_performed",
        }
    }
}

/// A single audited event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, starting at 1
    pub sequence: u64,
    pub kind: AuditEntryKind,
    pub snapshot_id: Option<String>,
    pub unit_id: Option<String>,
    pub operation: Option<RollbackOperationKind>,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    /// Hex SHA-1 over the previous digest and this entry's fields
    pub digest: String,
}

impl AuditEntry {
    fn compute_digest(&self, previous: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(previous.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        for field in [self.snapshot_id.as_deref(), self.unit_id.as_deref()] {
            hasher.update([u8::from(field.is_some())]);
            hasher.update(field.unwrap_or_default().as_bytes());
            hasher.update([0]);
        }
        hasher.update(self.operation.map_or("", RollbackOperationKind::as_str).as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.details.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Immutable copy of the trail and its counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExport {
    /// Rollbacks recorded, successful or not
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Percentage in `[0, 100]`
    pub success_rate: f64,
    pub last_operation_time: Option<DateTime<Utc>>,
    pub entries: Vec<AuditEntry>,
}

impl AuditExport {
    pub fn verify_chain(&self) -> EngineResult<()> {
        verify_chain(&self.entries)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Recompute the digest chain over `entries`.
pub fn verify_chain(entries: &[AuditEntry]) -> EngineResult<()> {
    let mut previous = GENESIS_DIGEST.to_string();
    for (position, entry) in entries.iter().enumerate() {
        let expected_sequence = position as u64 + 1;
        if entry.sequence != expected_sequence || entry.compute_digest(&previous) != entry.digest {
            return Err(EngineError::AuditChainBroken {
                sequence: expected_sequence,
            });
        }
        previous.clone_from(&entry.digest);
    }
    Ok(())
}

struct AuditLog {
    entries: Vec<AuditEntry>,
    last_digest: String,
}

/// Thread-safe audit trail.
pub struct AuditTrail {
    log: Mutex<AuditLog>,
    counters: OperationCounters,
}

impl AuditTrail {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Mutex::new(AuditLog {
                entries: Vec::new(),
                last_digest: GENESIS_DIGEST.to_string(),
            }),
            counters: OperationCounters::default(),
        }
    }

    pub async fn record_snapshot_created(
        &self,
        snapshot_id: &str,
        unit_id: &str,
        has_implementation: bool,
    ) {
        let details = if has_implementation {
            format!("Snapshot with implementation created for unit {unit_id}")
        } else {
            format!("Snapshot created for unit {unit_id}")
        };
        self.append(
            AuditEntryKind::SnapshotCreated,
            Some(snapshot_id),
            Some(unit_id),
            None,
            details,
        )
        .await;
    }

    pub async fn record_rollback_performed(
        &self,
        snapshot_id: &str,
        unit_id: &str,
        operation: RollbackOperationKind,
    ) {
        self.append(
            AuditEntryKind::RollbackPerformed,
            Some(snapshot_id),
            Some(unit_id),
            Some(operation),
            format!("Rollback performed: {}", operation.description()),
        )
        .await;
    }

    pub async fn record_rollback_failed(
        &self,
        snapshot_id: &str,
        unit_id: &str,
        operation: RollbackOperationKind,
        error: &str,
    ) {
        self.append(
            AuditEntryKind::RollbackFailed,
            Some(snapshot_id),
            Some(unit_id),
            Some(operation),
            format!("Rollback failed: {error}"),
        )
        .await;
    }

    pub async fn record_cleanup(&self, removed: usize) {
        self.append(
            AuditEntryKind::CleanupPerformed,
            None,
            None,
            None,
            format!("Cleanup performed: {removed} snapshots removed"),
        )
        .await;
    }

    async fn append(
        &self,
        kind: AuditEntryKind,
        snapshot_id: Option<&str>,
        unit_id: Option<&str>,
        operation: Option<RollbackOperationKind>,
        details: String,
    ) {
        let mut log = self.log.lock().await;
        let timestamp = Utc::now();

        let mut entry = AuditEntry {
            sequence: log.entries.len() as u64 + 1,
            kind,
            snapshot_id: snapshot_id.map(String::from),
            unit_id: unit_id.map(String::from),
            operation,
            timestamp,
            details,
            digest: String::new(),
        };
        entry.digest = entry.compute_digest(&log.last_digest);

        match kind {
            AuditEntryKind::RollbackPerformed => self.counters.record(true, timestamp),
            AuditEntryKind::RollbackFailed => self.counters.record(false, timestamp),
            AuditEntryKind::SnapshotCreated | AuditEntryKind::CleanupPerformed => {}
        }

        debug!(sequence = entry.sequence, kind = kind.as_str(), "Audit entry appended");
        log.last_digest.clone_from(&entry.digest);
        log.entries.push(entry);
    }

    /// Rollback counters as statistics.
    pub fn statistics(&self) -> RecoveryStatistics {
        self.counters.statistics()
    }

    pub async fn export(&self) -> AuditExport {
        let log = self.log.lock().await;
        let stats = self.counters.statistics();
        AuditExport {
            total_operations: stats.total_operations,
            successful_operations: stats.successful_operations,
            failed_operations: stats.failed_operations(),
            success_rate: stats.success_rate,
            last_operation_time: stats.last_operation_time,
            entries: log.entries.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Verify the live chain.
    pub async fn verify(&self) -> EngineResult<()> {
        let log = self.log.lock().await;
        verify_chain(&log.entries)
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counts_only_rollbacks() {
        let audit = AuditTrail::new();
        audit.record_snapshot_created("s1", "U1", false).await;
        audit
            .record_rollback_performed("s1", "U1", RollbackOperationKind::FullRestore)
            .await;
        audit
            .record_rollback_failed("s1", "U1", RollbackOperationKind::FullRestore, "boom")
            .await;
        audit.record_cleanup(0).await;

        let export = audit.export().await;
        assert_eq!(export.entries.len(), 4);
        assert_eq!(export.total_operations, 2);
        assert_eq!(export.successful_operations, 1);
        assert_eq!(export.failed_operations, 1);
        assert!((export.success_rate - 50.0).abs() < f64::EPSILON);
        assert!(export.last_operation_time.is_some());
        assert!(export.verify_chain().is_ok());
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let audit = AuditTrail::new();
        audit.record_snapshot_created("s1", "U1", false).await;
        audit
            .record_rollback_performed("s1", "U1", RollbackOperationKind::FullRestore)
            .await;
        audit.record_snapshot_created("s2", "U2", true).await;

        let mut export = audit.export().await;
        export.entries[1].unit_id = Some("U9".to_string());
        assert!(matches!(
            export.verify_chain(),
            Err(EngineError::AuditChainBroken { sequence: 2 })
        ));

        let mut export = audit.export().await;
        export.entries.remove(0);
        assert!(matches!(
            export.verify_chain(),
            Err(EngineError::AuditChainBroken { sequence: 1 })
        ));

        assert!(audit.verify().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_sequence() {
        let audit = Arc::new(AuditTrail::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let audit = Arc::clone(&audit);
            handles.push(tokio::spawn(async move {
                audit
                    .record_rollback_performed(
                        &format!("s{i}"),
                        &format!("U{i}"),
                        RollbackOperationKind::InstanceStateRestore,
                    )
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let export = audit.export().await;
        assert_eq!(export.total_operations, 16);
        let sequences: Vec<u64> = export.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=16).collect::<Vec<_>>());
        assert!(export.verify_chain().is_ok());
    }
}

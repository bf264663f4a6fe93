//! Document snapshots.
//!
//! A snapshot captures the full state of a document at a known operation
//! count, so a session can be rebuilt from it plus the operations logged
//! after its clock instead of replaying the whole history.

use chrono::{DateTime, Utc};
use quire_core::VectorClock;
use quire_text::{CrdtDocument, CrdtState, DocumentError, Operation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during snapshot operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Invalid snapshot data: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

impl From<DocumentError> for SnapshotError {
    fn from(err: DocumentError) -> Self {
        SnapshotError::InvalidData(err.to_string())
    }
}

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Full state of a document at a given operation count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Format version for compatibility.
    pub version: u8,

    /// Hex SHA-256 over the version, document id, count and state.
    pub digest: String,

    pub document_id: String,

    /// Operations the document had applied when captured.
    pub operation_count: u64,

    /// The causal frontier the state reflects.
    pub vector_clock: VectorClock,

    pub state: CrdtState,

    pub created_at: DateTime<Utc>,

    /// Server that took the snapshot.
    pub creator: String,
}

impl Snapshot {
    /// Capture a live document.
    pub fn capture(
        document_id: impl Into<String>,
        operation_count: u64,
        document: &CrdtDocument,
        creator: impl Into<String>,
    ) -> Result<Self, SnapshotError> {
        Self::new(
            document_id,
            operation_count,
            document.to_state(),
            creator,
            Utc::now(),
        )
    }

    /// Build a snapshot from exported state.
    pub fn new(
        document_id: impl Into<String>,
        operation_count: u64,
        state: CrdtState,
        creator: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, SnapshotError> {
        let document_id = document_id.into();
        let digest = compute_digest(SNAPSHOT_VERSION, &document_id, operation_count, &state)?;
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            digest,
            document_id,
            operation_count,
            vector_clock: state.vector_clock.clone(),
            state,
            created_at,
            creator: creator.into(),
        })
    }

    /// Recompute the digest and compare.
    pub fn verify(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                actual: self.version,
            });
        }
        let actual = compute_digest(
            self.version,
            &self.document_id,
            self.operation_count,
            &self.state,
        )?;
        if actual != self.digest {
            return Err(SnapshotError::DigestMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Rebuild the document this snapshot was taken from.
    pub fn restore(&self) -> Result<CrdtDocument, SnapshotError> {
        self.verify()?;
        Ok(CrdtDocument::from_state(self.state.clone())?)
    }

    /// Rebuild the document and apply `operations` on top.
    ///
    /// Operations already reflected in the snapshot are skipped by the
    /// document's own idempotence.
    pub fn restore_with<'a>(
        &self,
        operations: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<CrdtDocument, SnapshotError> {
        let mut document = self.restore()?;
        for op in operations {
            document.apply_operation(op)?;
        }
        Ok(document)
    }

    /// Whether the snapshot already reflects everything in `clock`.
    pub fn covers(&self, clock: &VectorClock) -> bool {
        self.vector_clock.dominates(clock)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        snapshot.verify()?;
        Ok(snapshot)
    }
}

fn compute_digest(
    version: u8,
    document_id: &str,
    operation_count: u64,
    state: &CrdtState,
) -> Result<String, SnapshotError> {
    let mut hasher = Sha256::new();
    hasher.update([version]);
    hasher.update(document_id.as_bytes());
    hasher.update(operation_count.to_le_bytes());
    hasher.update(serde_json::to_vec(state)?);
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

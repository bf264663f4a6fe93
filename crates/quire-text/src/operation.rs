//! Operations: the immutable mutation records replicas exchange.

use crate::error::{DocumentError, Result};
use quire_core::OpId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute delta of a format operation. A `null` value clears the attribute.
pub type Attributes = BTreeMap<String, Value>;

/// What an operation does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpKind {
    /// Create unit `(site_id, counter)` right after `origin`
    /// (`None` = document start).
    Insert {
        value: String,
        #[serde(default)]
        origin: Option<OpId>,
    },
    /// Tombstone a unit.
    Delete { target: OpId },
    /// Apply an attribute delta to every unit from `start` to `end` inclusive.
    Format {
        start: OpId,
        end: OpId,
        attributes: Attributes,
    },
}

/// A uniquely identified mutation of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub site_id: String,
    pub counter: u64,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Operation {
    pub fn insert(
        site_id: impl Into<String>,
        counter: u64,
        origin: Option<OpId>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            counter,
            kind: OpKind::Insert {
                value: value.into(),
                origin,
            },
        }
    }

    pub fn delete(site_id: impl Into<String>, counter: u64, target: OpId) -> Self {
        Self {
            site_id: site_id.into(),
            counter,
            kind: OpKind::Delete { target },
        }
    }

    pub fn format(
        site_id: impl Into<String>,
        counter: u64,
        start: OpId,
        end: OpId,
        attributes: Attributes,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            counter,
            kind: OpKind::Format {
                start,
                end,
                attributes,
            },
        }
    }

    /// The `(site, counter)` identity of this operation.
    pub fn id(&self) -> OpId {
        OpId::new(self.site_id.clone(), self.counter)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Format { .. } => "format",
        }
    }

    /// Units that must exist locally before this operation can take effect.
    pub fn dependencies(&self) -> Vec<&OpId> {
        match &self.kind {
            OpKind::Insert { origin, .. } => origin.iter().collect(),
            OpKind::Delete { target } => vec![target],
            OpKind::Format { start, end, .. } => vec![start, end],
        }
    }

    /// Structural checks that need no document context.
    pub fn validate(&self) -> Result<()> {
        let id = self.id();
        if self.site_id.is_empty() {
            return Err(DocumentError::malformed(&id, "empty site id"));
        }
        if self.counter == 0 {
            return Err(DocumentError::malformed(&id, "counter must start at 1"));
        }
        match &self.kind {
            OpKind::Insert { value, origin } => {
                if value.is_empty() {
                    return Err(DocumentError::malformed(&id, "insert without content"));
                }
                if origin.as_ref() == Some(&id) {
                    return Err(DocumentError::malformed(&id, "insert anchored to itself"));
                }
            }
            OpKind::Delete { target } => {
                if target.counter == 0 {
                    return Err(DocumentError::malformed(&id, "delete of the document start"));
                }
            }
            OpKind::Format { attributes, .. } => {
                if attributes.is_empty() {
                    return Err(DocumentError::malformed(&id, "empty attribute delta"));
                }
                if attributes.keys().any(String::is_empty) {
                    return Err(DocumentError::malformed(&id, "empty attribute name"));
                }
            }
        }
        Ok(())
    }

    /// Decode and validate an operation.
    pub fn from_json(json: &str) -> Result<Self> {
        let op: Operation = serde_json::from_str(json)
            .map_err(|e| DocumentError::malformed("<undecodable>", e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

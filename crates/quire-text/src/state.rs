//! Serializable document state.
//!
//! [`CrdtState`] is what snapshots persist and what a joining client receives.
//! Units are listed in document order, tombstones included, so the state can
//! be rebuilt without replaying the operations that produced it.

use crate::error::Result;
use crate::operation::{Attributes, Operation};
use quire_core::{DotSet, LwwRegister, OpId, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One unit of the sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
    pub id: OpId,
    pub origin: Option<OpId>,
    /// Sibling ordering key. Absent when equal to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<OpId>,
    pub value: String,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<OpId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, LwwRegister<Value>>,
}

impl UnitState {
    /// Attributes with a non-null winning value.
    pub fn visible_attributes(&self) -> BTreeMap<String, Value> {
        self.attributes
            .iter()
            .filter_map(|(name, reg)| match reg.get() {
                Some(Value::Null) | None => None,
                Some(value) => Some((name.clone(), value.clone())),
            })
            .collect()
    }
}

/// A format operation as recorded in the document.
///
/// Marks are kept so that units inserted inside a formatted range later on
/// receive the same attributes, whatever order the operations arrived in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatMark {
    pub stamp: OpId,
    pub start: OpId,
    pub end: OpId,
    pub attributes: Attributes,
}

/// Full replica state of a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtState {
    pub units: Vec<UnitState>,
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub applied: DotSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<FormatMark>,
}

impl CrdtState {
    /// Concatenated values of the live units.
    pub fn text(&self) -> String {
        self.units
            .iter()
            .filter(|u| !u.deleted)
            .map(|u| u.value.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

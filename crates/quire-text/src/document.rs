//! Rich-text sequence CRDT.
//!
//! Every inserted unit records the unit it was typed after (its *origin*).
//! Units sharing an origin are siblings and are placed in ascending [`OpId`]
//! order, each followed by its own descendants. Deleted units stay in the
//! sequence as tombstones until [`CrdtDocument::garbage_collect_tombstones`]
//! proves no replica can still refer to them.
//!
//! Formatting is per-attribute last-writer-wins. Format operations are kept
//! as [`FormatMark`]s so units inserted into a formatted range pick up the
//! range's attributes regardless of arrival order.
//!
//! Operations whose dependencies are not present yet are parked and applied
//! once the missing units arrive.

use crate::error::{DocumentError, Result};
use crate::operation::{Attributes, OpKind, Operation};
use crate::state::{CrdtState, FormatMark, UnitState};
use quire_core::{DotSet, LwwRegister, OpId, VectorClock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A unit in the sequence.
#[derive(Clone, Debug)]
struct Unit {
    id: OpId,
    origin: Option<OpId>,
    /// Sort key among siblings. Starts as `id`; a unit re-homed by garbage
    /// collection takes over the rank of its collected parent.
    rank: OpId,
    value: String,
    deleted: bool,
    /// Smallest id among the operations that deleted this unit.
    deleted_by: Option<OpId>,
    attributes: BTreeMap<String, LwwRegister<Value>>,
}

impl Unit {
    fn visible_attributes(&self) -> BTreeMap<String, Value> {
        self.attributes
            .iter()
            .filter_map(|(name, reg)| match reg.get() {
                Some(Value::Null) | None => None,
                Some(value) => Some((name.clone(), value.clone())),
            })
            .collect()
    }

    fn apply_attributes(&mut self, attributes: &Attributes, stamp: &OpId) {
        for (name, value) in attributes {
            self.attributes
                .entry(name.clone())
                .or_default()
                .set(value.clone(), stamp);
        }
    }
}

/// A live unit as seen by readers.
#[derive(Clone, Debug, PartialEq)]
pub struct VisibleUnit {
    pub id: OpId,
    pub value: String,
    pub attributes: BTreeMap<String, Value>,
}

/// Collaborative rich-text document.
#[derive(Clone, Debug, Default)]
pub struct CrdtDocument {
    units: HashMap<OpId, Unit>,
    /// Document order, tombstones included.
    order: Vec<OpId>,
    clock: VectorClock,
    applied: DotSet,
    /// Accepted operations waiting for a unit they reference.
    pending: BTreeMap<OpId, Operation>,
    marks: Vec<FormatMark>,
}

impl CrdtDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an operation.
    ///
    /// Returns `Ok(true)` if the operation was new, `Ok(false)` for a
    /// duplicate. An operation referencing units not yet present is accepted
    /// and held until they arrive. A malformed operation is rejected and the
    /// document is left untouched.
    pub fn apply_operation(&mut self, op: &Operation) -> Result<bool> {
        op.validate()?;
        let id = op.id();
        if self.applied.contains(&id) {
            return Ok(false);
        }

        if self.is_ready(op) {
            self.integrate(op);
        } else {
            self.pending.insert(id.clone(), op.clone());
        }

        self.applied.insert(&id);
        self.clock.observe(&id);
        self.drain_pending();
        Ok(true)
    }

    /// Highest applied counter per site.
    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Exact set of applied operation ids.
    pub fn applied(&self) -> &DotSet {
        &self.applied
    }

    /// Whether an operation with this id has been accepted.
    pub fn has_applied(&self, id: &OpId) -> bool {
        self.applied.contains(id)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        op.dependencies()
            .into_iter()
            .all(|dep| self.units.contains_key(dep))
    }

    /// Callers check [`Self::is_ready`] first; a ready operation always
    /// integrates, whether it arrives directly or leaves the pending buffer.
    fn integrate(&mut self, op: &Operation) {
        let id = op.id();
        match &op.kind {
            OpKind::Insert { value, origin } => self.integrate_insert(id, origin.clone(), value),
            OpKind::Delete { target } => self.integrate_delete(id, target),
            OpKind::Format {
                start,
                end,
                attributes,
            } => self.integrate_format(id, start, end, attributes),
        }
    }

    /// Apply every parked operation whose dependencies are now satisfied.
    fn drain_pending(&mut self) {
        loop {
            let ready: Vec<OpId> = self
                .pending
                .iter()
                .filter(|(_, op)| self.is_ready(op))
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if let Some(op) = self.pending.remove(&id) {
                    self.integrate(&op);
                }
            }
        }
    }

    fn integrate_insert(&mut self, id: OpId, origin: Option<OpId>, value: &str) {
        let positions = self.positions();
        let start = origin
            .as_ref()
            .and_then(|parent| positions.get(parent))
            .map_or(0, |&i| i + 1);

        // Skip siblings that sort before the new unit along with their whole
        // subtrees. A subtree is contiguous in `order`, so a unit belongs to
        // one exactly when its origin was skipped already.
        let mut skipped: HashSet<&OpId> = HashSet::new();
        let mut index = start;
        while index < self.order.len() {
            let Some(unit) = self.units.get(&self.order[index]) else {
                break;
            };
            if unit.origin == origin {
                if unit.rank > id {
                    break;
                }
            } else if !unit.origin.as_ref().is_some_and(|o| skipped.contains(o)) {
                break;
            }
            skipped.insert(&unit.id);
            index += 1;
        }

        let mut unit = Unit {
            id: id.clone(),
            origin,
            rank: id.clone(),
            value: value.to_string(),
            deleted: false,
            deleted_by: None,
            attributes: BTreeMap::new(),
        };

        for mark in &self.marks {
            if let (Some(&a), Some(&b)) = (positions.get(&mark.start), positions.get(&mark.end)) {
                if a.min(b) < index && index <= a.max(b) {
                    unit.apply_attributes(&mark.attributes, &mark.stamp);
                }
            }
        }

        self.order.insert(index, id.clone());
        self.units.insert(id, unit);
    }

    fn integrate_delete(&mut self, id: OpId, target: &OpId) {
        if let Some(unit) = self.units.get_mut(target) {
            unit.deleted = true;
            if unit.deleted_by.as_ref().map_or(true, |by| id < *by) {
                unit.deleted_by = Some(id);
            }
        }
    }

    /// The range covers every unit between the two endpoints, whichever of
    /// them comes first in the document.
    fn integrate_format(&mut self, id: OpId, start: &OpId, end: &OpId, attributes: &Attributes) {
        let (Some(s), Some(e)) = (self.index_of(start), self.index_of(end)) else {
            return;
        };
        for unit_id in &self.order[s.min(e)..=s.max(e)] {
            if let Some(unit) = self.units.get_mut(unit_id) {
                unit.apply_attributes(attributes, &id);
            }
        }
        self.marks.push(FormatMark {
            stamp: id,
            start: start.clone(),
            end: end.clone(),
            attributes: attributes.clone(),
        });
    }

    /// Physically remove tombstones every replica is known to have seen.
    ///
    /// A tombstone is collectable when `mov` covers both the unit and the
    /// operation that deleted it. Endpoints of format ranges are kept. Units
    /// anchored to a collected unit take over its origin and sibling rank,
    /// so their position and all future placements are unchanged.
    ///
    /// Returns the number of units removed.
    pub fn garbage_collect_tombstones(&mut self, mov: &VectorClock) -> usize {
        let protected: HashSet<OpId> = self
            .marks
            .iter()
            .flat_map(|m| [m.start.clone(), m.end.clone()])
            .collect();

        let mut rehomed: HashMap<OpId, (Option<OpId>, OpId)> = HashMap::new();
        let mut kept = Vec::with_capacity(self.order.len());
        let mut removed = 0;

        for id in std::mem::take(&mut self.order) {
            let Some(unit) = self.units.get_mut(&id) else {
                continue;
            };
            if let Some((origin, rank)) = unit.origin.as_ref().and_then(|o| rehomed.get(o)) {
                unit.origin = origin.clone();
                unit.rank = rank.clone();
            }

            let collectable = unit.deleted
                && mov.covers(&unit.id)
                && unit.deleted_by.as_ref().is_some_and(|by| mov.covers(by))
                && !protected.contains(&id);

            if collectable {
                rehomed.insert(id.clone(), (unit.origin.clone(), unit.rank.clone()));
                self.units.remove(&id);
                removed += 1;
            } else {
                kept.push(id);
            }
        }

        self.order = kept;
        removed
    }

    /// Drop parked operations matching `predicate`, returning them.
    ///
    /// Parked operations stay accepted; their ids are not forgotten.
    pub fn expire_pending<F>(&mut self, mut predicate: F) -> Vec<Operation>
    where
        F: FnMut(&Operation) -> bool,
    {
        let expired: Vec<OpId> = self
            .pending
            .iter()
            .filter(|(_, op)| predicate(op))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Parked operations in id order.
    pub fn pending_operations(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Export the full state.
    pub fn to_state(&self) -> CrdtState {
        let units = self
            .order
            .iter()
            .filter_map(|id| self.units.get(id))
            .map(|u| UnitState {
                id: u.id.clone(),
                origin: u.origin.clone(),
                rank: (u.rank != u.id).then(|| u.rank.clone()),
                value: u.value.clone(),
                deleted: u.deleted,
                deleted_by: u.deleted_by.clone(),
                attributes: u.attributes.clone(),
            })
            .collect();

        CrdtState {
            units,
            vector_clock: self.clock.clone(),
            applied: self.applied.clone(),
            pending: self.pending.values().cloned().collect(),
            marks: self.marks.clone(),
        }
    }

    /// Rebuild a document from exported state.
    pub fn from_state(state: CrdtState) -> Result<Self> {
        let mut doc = CrdtDocument::new();

        for unit in state.units {
            if doc.units.contains_key(&unit.id) {
                return Err(DocumentError::InvalidState(format!(
                    "duplicate unit {}",
                    unit.id
                )));
            }
            doc.applied.insert(&unit.id);
            doc.clock.observe(&unit.id);
            doc.order.push(unit.id.clone());
            doc.units.insert(
                unit.id.clone(),
                Unit {
                    rank: unit.rank.unwrap_or_else(|| unit.id.clone()),
                    id: unit.id,
                    origin: unit.origin,
                    value: unit.value,
                    deleted: unit.deleted,
                    deleted_by: unit.deleted_by,
                    attributes: unit.attributes,
                },
            );
        }

        for mark in &state.marks {
            if !doc.units.contains_key(&mark.start) || !doc.units.contains_key(&mark.end) {
                return Err(DocumentError::InvalidState(format!(
                    "format mark {} references a missing unit",
                    mark.stamp
                )));
            }
        }
        doc.marks = state.marks;

        for op in state.pending {
            op.validate()?;
            if doc.units.contains_key(&op.id()) {
                return Err(DocumentError::InvalidState(format!(
                    "pending operation {} is already integrated",
                    op.id()
                )));
            }
            doc.pending.insert(op.id(), op);
        }

        doc.clock.merge(&state.vector_clock);
        doc.applied = merge_dots(doc.applied, &state.applied, &state.vector_clock);

        Ok(doc)
    }

    /// Concatenated values of the live units.
    pub fn text(&self) -> String {
        self.live_units().map(|u| u.value.as_str()).collect()
    }

    /// Number of live units.
    pub fn len(&self) -> usize {
        self.live_units().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live units in document order.
    pub fn visible_units(&self) -> Vec<VisibleUnit> {
        self.live_units()
            .map(|u| VisibleUnit {
                id: u.id.clone(),
                value: u.value.clone(),
                attributes: u.visible_attributes(),
            })
            .collect()
    }

    /// Non-null attributes of a unit, live or tombstoned.
    pub fn attributes_of(&self, id: &OpId) -> Option<BTreeMap<String, Value>> {
        self.units.get(id).map(Unit::visible_attributes)
    }

    /// Id of the live unit at a visible position.
    pub fn id_at(&self, position: usize) -> Option<&OpId> {
        self.live_units().nth(position).map(|u| &u.id)
    }

    /// Visible position of a live unit.
    pub fn position_of(&self, id: &OpId) -> Option<usize> {
        let mut position = 0;
        for unit in self.live_units() {
            if &unit.id == id {
                return Some(position);
            }
            position += 1;
        }
        None
    }

    /// Whether the unit is present, as a live unit or tombstone.
    pub fn contains_unit(&self, id: &OpId) -> bool {
        self.units.contains_key(id)
    }

    /// `Some(true)` for a tombstone, `None` if the unit is not present.
    pub fn is_deleted(&self, id: &OpId) -> Option<bool> {
        self.units.get(id).map(|u| u.deleted)
    }

    /// Units held, tombstones included.
    pub fn unit_count(&self) -> usize {
        self.order.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.units.values().filter(|u| u.deleted).count()
    }

    /// Format operations recorded so far.
    pub fn format_marks(&self) -> &[FormatMark] {
        &self.marks
    }

    fn live_units(&self) -> impl Iterator<Item = &Unit> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.units.get(id))
            .filter(|u| !u.deleted)
    }

    fn index_of(&self, id: &OpId) -> Option<usize> {
        self.order.iter().position(|x| x == id)
    }

    /// Index of every unit in `order`, built once per insert.
    fn positions(&self) -> HashMap<&OpId, usize> {
        self.order.iter().enumerate().map(|(i, id)| (id, i)).collect()
    }
}

/// Union of the dots rebuilt from units with the exported set.
///
/// Collected units leave no trace in `units`, so the exported set is
/// authoritative; an empty exported set falls back to the clock.
fn merge_dots(mut rebuilt: DotSet, exported: &DotSet, clock: &VectorClock) -> DotSet {
    if exported.is_empty() {
        for (site, &counter) in clock.iter() {
            for c in 1..=counter {
                rebuilt.insert(&OpId::new(site.clone(), c));
            }
        }
        return rebuilt;
    }
    let mut merged = exported.clone();
    for (site, &counter) in rebuilt.frontier().iter() {
        for c in 1..=counter {
            merged.insert(&OpId::new(site.clone(), c));
        }
    }
    merged
}

impl PartialEq for CrdtDocument {
    /// Documents are equal when readers see the same thing.
    fn eq(&self, other: &Self) -> bool {
        self.visible_units() == other.visible_units()
    }
}

impl std::fmt::Display for CrdtDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

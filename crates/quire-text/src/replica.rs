//! Local editing on top of a [`CrdtDocument`].
//!
//! A [`Replica`] turns position-based edits into operations stamped with
//! its own site id, applies them locally and hands them back for sending.

use crate::document::CrdtDocument;
use crate::error::{DocumentError, Result};
use crate::operation::{Attributes, Operation};
use quire_core::{OpId, VectorClock};

/// An editing site: a site id, a Lamport counter and a document.
#[derive(Clone, Debug)]
pub struct Replica {
    site: String,
    counter: u64,
    document: CrdtDocument,
}

impl Replica {
    pub fn new(site: impl Into<String>) -> Self {
        Self::from_document(site, CrdtDocument::new())
    }

    /// Continue editing an existing document.
    pub fn from_document(site: impl Into<String>, document: CrdtDocument) -> Self {
        Self {
            site: site.into(),
            counter: 0,
            document,
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn document(&self) -> &CrdtDocument {
        &self.document
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn vector_clock(&self) -> &VectorClock {
        self.document.vector_clock()
    }

    /// Next counter: greater than anything this replica has seen.
    fn next_counter(&mut self) -> u64 {
        self.counter = self.counter.max(self.document.vector_clock().max_counter()) + 1;
        self.counter
    }

    fn check_position(&self, position: usize) -> Result<()> {
        let length = self.document.len();
        if position > length {
            return Err(DocumentError::IndexOutOfBounds {
                index: position,
                length,
            });
        }
        Ok(())
    }

    /// Insert `text` anchored after the visible unit at `position - 1`, one
    /// unit per character.
    ///
    /// `position` names the anchor, not the final offset. New units always
    /// carry the highest id this replica has seen, and siblings with higher
    /// ids sort later, so the text lands after everything already typed
    /// after the anchor (its whole subtree). It only ends up exactly at
    /// `position` when the anchor has no children yet, as when typing at
    /// the end of a run or at the end of the document.
    ///
    /// ```
    /// use quire_text::Replica;
    ///
    /// let mut replica = Replica::new("A");
    /// replica.insert(0, "ab").unwrap();
    /// // "b" was typed after "a", so "X" goes after "b" as well.
    /// replica.insert(1, "X").unwrap();
    /// assert_eq!(replica.text(), "abX");
    /// ```
    ///
    /// Use [`CrdtDocument::position_of`] on the returned ids to find where
    /// the text landed.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<Vec<Operation>> {
        self.check_position(position)?;
        let mut origin = match position {
            0 => None,
            p => self.document.id_at(p - 1).cloned(),
        };

        let mut ops = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            let counter = self.next_counter();
            let op = Operation::insert(self.site.clone(), counter, origin, ch.to_string());
            self.document.apply_operation(&op)?;
            origin = Some(op.id());
            ops.push(op);
        }
        Ok(ops)
    }

    /// Delete `length` visible units starting at `position`.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<Vec<Operation>> {
        self.check_position(position + length)?;
        let targets: Vec<OpId> = (position..position + length)
            .filter_map(|p| self.document.id_at(p).cloned())
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let counter = self.next_counter();
            let op = Operation::delete(self.site.clone(), counter, target);
            self.document.apply_operation(&op)?;
            ops.push(op);
        }
        Ok(ops)
    }

    /// Apply `attributes` to the visible range `start..end`.
    pub fn format(&mut self, start: usize, end: usize, attributes: Attributes) -> Result<Operation> {
        self.check_position(end)?;
        if start >= end {
            return Err(DocumentError::IndexOutOfBounds {
                index: start,
                length: end,
            });
        }
        let (Some(first), Some(last)) = (
            self.document.id_at(start).cloned(),
            self.document.id_at(end - 1).cloned(),
        ) else {
            return Err(DocumentError::IndexOutOfBounds {
                index: end,
                length: self.document.len(),
            });
        };

        let counter = self.next_counter();
        let op = Operation::format(self.site.clone(), counter, first, last, attributes);
        self.document.apply_operation(&op)?;
        Ok(op)
    }

    /// Apply an operation from another site.
    pub fn receive(&mut self, op: &Operation) -> Result<bool> {
        self.document.apply_operation(op)
    }

    /// Consume the replica, keeping the document.
    pub fn into_document(self) -> CrdtDocument {
        self.document
    }
}

//! Last-Write-Wins register stamped with operation ids.
//!
//! Each formatting attribute of a text unit is one of these registers. The
//! write carrying the greatest [`OpId`] wins: higher counter first, higher
//! site on equal counters. Distinct attributes live in distinct registers, so
//! concurrent writes to different attributes never overwrite each other.

use crate::id::OpId;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: Option<T>,
    stamp: Option<OpId>,
}

impl<T: Clone> LwwRegister<T> {
    /// An empty register.
    pub fn new() -> Self {
        Self {
            value: None,
            stamp: None,
        }
    }

    /// A register holding `value` written by `stamp`.
    pub fn with_value(value: T, stamp: OpId) -> Self {
        Self {
            value: Some(value),
            stamp: Some(stamp),
        }
    }

    /// Write `value` if `stamp` beats the current stamp.
    ///
    /// Returns whether the write took effect.
    pub fn set(&mut self, value: T, stamp: &OpId) -> bool {
        if self.stamp.as_ref().is_some_and(|current| current >= stamp) {
            return false;
        }
        self.value = Some(value);
        self.stamp = Some(stamp.clone());
        true
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> Option<&OpId> {
        self.stamp.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

impl<T: Clone> Default for LwwRegister<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq> Lattice for LwwRegister<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        if other.stamp > self.stamp {
            other.clone()
        } else {
            self.clone()
        }
    }
}

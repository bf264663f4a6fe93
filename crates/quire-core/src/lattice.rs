//! Join-semilattice trait.
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! Clocks and attribute registers merge through this trait, which is what lets
//! replicas apply the same operations in any order and still agree.

/// State that merges by least upper bound.
pub trait Lattice: Clone + PartialEq {
    /// The bottom element (identity for join).
    fn bottom() -> Self;

    /// Least upper bound of `self` and `other`.
    fn join(&self, other: &Self) -> Self;

    /// `self = self ⊔ other`
    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }

    /// `self ≤ other` in the lattice order.
    fn leq(&self, other: &Self) -> bool {
        &self.join(other) == other
    }
}

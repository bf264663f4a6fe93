// File: `crates/quire-core/src/lib.rs`
//! Primitives shared by every Quire crate.
//!
//! - [`OpId`]: the `(site, counter)` identity of operations and text units
//! - [`VectorClock`]: per-site causal frontier
//! - [`DotSet`]: exact set of applied operation ids
//! - [`LwwRegister`]: last-writer-wins register keyed by [`OpId`]
//! - [`Lattice`]: the join-semilattice trait the above implement

pub mod clock;
pub mod id;
pub mod lattice;
pub mod lwwreg;

pub use clock::{ClockEntry, DotSet, VectorClock};
pub use id::{OpId, SiteId};
pub use lattice::Lattice;
pub use lwwreg::LwwRegister;

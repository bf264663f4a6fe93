// File: `crates/quire-text/src/lib.rs`
//! # Quire Text
//!
//! Collaborative rich-text document as an operation-based sequence CRDT.
//!
//! ## Features
//!
//! - **Convergence**: replicas applying the same set of operations in any
//!   order, with duplicates, end with identical content and formatting
//! - **Causal buffering**: operations that reference units not yet received
//!   are held and applied once those units arrive
//! - **Formatting**: per-attribute last-writer-wins, including for text typed
//!   into a formatted range later on
//! - **Tombstone GC**: deleted units are removed once every replica has seen
//!   the deletion, without moving any surviving unit
//!
//! ## Example
//!
//! ```rust
//! use quire_text::Replica;
//!
//! let mut alice = Replica::new("alice");
//! let mut bob = Replica::new("bob");
//!
//! for op in alice.insert(0, "Hello").unwrap() {
//!     bob.receive(&op).unwrap();
//! }
//! for op in bob.insert(5, "!").unwrap() {
//!     alice.receive(&op).unwrap();
//! }
//!
//! assert_eq!(alice.text(), "Hello!");
//! assert_eq!(alice.document(), bob.document());
//! ```

pub mod document;
pub mod error;
pub mod operation;
pub mod replica;
pub mod state;

pub use document::{CrdtDocument, VisibleUnit};
pub use error::{DocumentError, Result};
pub use operation::{Attributes, OpKind, Operation};
pub use replica::Replica;
pub use state::{CrdtState, FormatMark, UnitState};

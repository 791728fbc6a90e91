//! # Composition Graph
//!
//! The two composite node variants. A composition is itself a node, so
//! sequences and parallel nodes nest freely; the resulting tree is immutable
//! once built.
//!
//! - [`Sequence`]: pipes each step's output into the next step.
//! - [`Parallel`]: fans one input out to named branches and collects a
//!   `name → output` mapping.
//!
//! Use [`crate::node::sequence`], [`crate::node::parallel`] or
//! [`crate::node::Node::pipe`] to build them.

mod parallel;
mod sequence;

pub use parallel::Parallel;
pub use sequence::Sequence;

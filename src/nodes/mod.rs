//! # Node Adapters
//!
//! Ready-made runnables:
//!
//! - [`Lambda`]: a synchronous closure.
//! - [`AsyncLambda`]: a closure returning a future.
//! - [`StreamingLambda`]: a closure returning a stream of output chunks.
//! - [`Generator`]: a closure from an input chunk stream to an output chunk
//!   stream, which lets a sequence fuse it with the step before it.
//! - [`Passthrough`]: identity, optionally merging derived values into the input.
//! - [`Bound`]: a node with bound parameters or a configuration overlay, produced
//!   by [`Node::bind`](crate::node::Node::bind) and
//!   [`Node::with_config`](crate::node::Node::with_config).

mod bound;
mod lambda;
mod passthrough;

pub use bound::Bound;
pub use lambda::{AsyncLambda, Generator, Lambda, StreamingLambda};
pub use passthrough::{Passthrough, passthrough, passthrough_assign};

#[cfg(test)]
mod nodes_test;

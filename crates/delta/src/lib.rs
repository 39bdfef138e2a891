//! Model delta trees for the canopy synchronization engine.
//!
//! A [`Delta`] is an immutable-once-built, tree-shaped description of what changed
//! in a backend model: which elements were added, removed, refreshed, expanded,
//! selected, and so on. Deltas are produced by model-side proxies, handed to the
//! coordination actor over a channel, consumed in one pass, and discarded.

use std::fmt;
use std::hash::Hash;

mod flags;
mod node;
mod path;

pub use flags::DeltaFlags;
pub use node::{Delta, DeltaVisitor, InvalidDeltaError, NodeId, Visit};
pub use path::TreePath;

/// Bounds required of a model element identity.
///
/// Elements are compared by value equality; the engine never assumes pointer
/// identity. Implemented for every type that satisfies the bounds.
pub trait Element: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Element for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

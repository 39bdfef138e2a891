//! Protocol verifier and scriptable test model for the tree-synchronization
//! engine.
//!
//! [`ProtocolVerifier`] observes a live coordinator and checks the update
//! protocol's guarantees as they happen: balanced sequence events, coalescing
//! of duplicate requests, and completion ordering per element. [`TestModel`]
//! is a mutable in-memory tree that answers content source queries with
//! optional latency and emits deltas for its own mutations, and
//! [`RecordingSurface`] mirrors every viewer operation so tests can assert on
//! the final presented tree as well as the exact operation stream.

mod model;
mod surface;
mod verifier;

pub use model::{TestElement, TestModel, test_path};
pub use surface::{RecordingSurface, SurfaceOp};
pub use verifier::{ProtocolVerifier, ProtocolViolation};

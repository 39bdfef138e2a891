//! Asynchronous tree-synchronization engine.
//!
//! Keeps a displayed, lazily-populated tree consistent with a backend model that
//! changes concurrently and is queried asynchronously. Model changes arrive as
//! [`Delta`](canopy_delta::Delta) trees; the [`TreeCoordinator`] turns them into a
//! minimal set of coalesced [`UpdateKind`] queries against a [`ContentSource`],
//! runs those on a bounded worker pool, and applies completions to an abstract
//! [`ViewerSurface`] from a single coordination task.
//!
//! Nothing in this crate renders. Rendering, persistence, and domain semantics
//! live behind the [`ContentSource`] and [`ViewerSurface`] seams.

mod coordinator;
mod error;
mod filter;
mod observer;
mod proxy;
mod queue;
mod request;
mod source;
mod state;
mod surface;

pub use canopy_delta::{Delta, DeltaFlags, Element, InvalidDeltaError, TreePath};
pub use coordinator::{CoordinatorOptions, TreeCoordinator};
pub use error::{ContentSourceError, SourceResult};
pub use filter::ViewFilter;
pub use observer::CoordinatorObserver;
pub use proxy::{DeltaSender, ModelProxy};
pub use request::{KindClass, RequestDescriptor, UpdateKind, UpdateState};
pub use source::{ContentSource, Label, StateToken, ViewContext};
pub use state::MementoNode;
pub use surface::ViewerSurface;

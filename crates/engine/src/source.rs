use std::sync::Arc;

use async_trait::async_trait;
use canopy_delta::{Element, TreePath};

use crate::error::SourceResult;
use crate::proxy::ModelProxy;
use crate::request::KindClass;

/// Presentation context handed to every content source query.
///
/// Identifies the consuming view and the columns it shows; the engine treats
/// both as opaque.
#[derive(Debug, Clone, Default)]
pub struct ViewContext {
	/// Identifier of the consuming view.
	pub id: String,
	/// Visible columns; empty means a single unnamed column.
	pub columns: Vec<String>,
}

impl ViewContext {
	/// Context for a single-column view.
	pub fn new(id: impl Into<String>) -> Self {
		Self { id: id.into(), columns: Vec::new() }
	}

	/// Context for a columned view.
	pub fn with_columns(id: impl Into<String>, columns: Vec<String>) -> Self {
		Self { id: id.into(), columns }
	}
}

/// RGB triple for label colors.
pub type Rgb = (u8, u8, u8);

/// Presentation attributes of one element in one column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Label {
	/// Display text.
	pub text: String,
	/// Opaque image reference.
	pub image: Option<String>,
	/// Opaque font reference.
	pub font: Option<String>,
	/// Foreground color.
	pub foreground: Option<Rgb>,
	/// Background color.
	pub background: Option<Rgb>,
	/// Set when the label shows a query error rather than model content.
	pub error: bool,
}

impl Label {
	/// Plain text label.
	pub fn text(text: impl Into<String>) -> Self {
		Self { text: text.into(), ..Self::default() }
	}

	/// Error-state label shown when the underlying query failed.
	pub fn error(message: impl Into<String>) -> Self {
		Self {
			text: message.into(),
			error: true,
			..Self::default()
		}
	}
}

/// Opaque, comparable encoding of an element identity.
///
/// Produced by [`ContentSource::encode_element`] and consumed by the viewer
/// state store as memento keys. How tokens serialize is the persistence
/// collaborator's concern, not this engine's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateToken(Arc<str>);

impl StateToken {
	/// Wraps an encoded identity.
	pub fn new(encoded: impl Into<Arc<str>>) -> Self {
		Self(encoded.into())
	}

	/// The encoded form.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

/// Asynchronous backend model queries.
///
/// All methods are queries; the engine never asks a source to mutate anything.
/// Calls run on worker tasks, so implementations must be `Send + Sync` and may
/// take as long as they need — cancellation is signalled out of band and a
/// late answer is discarded by the coordinator.
#[async_trait]
pub trait ContentSource<E: Element>: Send + Sync {
	/// Whether the element at `path` has children.
	async fn has_children(&self, path: &TreePath<E>, context: &ViewContext) -> SourceResult<bool>;

	/// Number of children of the element at `path`.
	async fn child_count(&self, path: &TreePath<E>, context: &ViewContext) -> SourceResult<usize>;

	/// Children of the element at `path` in `[offset, offset + length)`.
	async fn children(&self, path: &TreePath<E>, context: &ViewContext, offset: usize, length: usize) -> SourceResult<Vec<E>>;

	/// Label of the element at `path` for `column`.
	async fn label(&self, path: &TreePath<E>, context: &ViewContext, column: Option<&str>) -> SourceResult<Label>;

	/// Encodes an element into an opaque token for state save.
	async fn encode_element(&self, element: &E, context: &ViewContext) -> SourceResult<StateToken>;

	/// Whether `candidate` is the element a token was encoded from.
	async fn compare_element(&self, candidate: &E, token: &StateToken, context: &ViewContext) -> SourceResult<bool>;

	/// Whether sibling requests of `kind` may be dispatched as one batched call.
	fn supports_batching(&self, kind: KindClass) -> bool {
		let _ = kind;
		false
	}

	/// Batched child counts for siblings sharing one parent context.
	///
	/// The default loops over [`Self::child_count`]; sources that can answer
	/// several siblings in one backend round trip should override it and
	/// declare support via [`Self::supports_batching`].
	async fn child_counts(&self, paths: &[TreePath<E>], context: &ViewContext) -> Vec<SourceResult<usize>> {
		let mut out = Vec::with_capacity(paths.len());
		for path in paths {
			out.push(self.child_count(path, context).await);
		}
		out
	}

	/// Batched labels for siblings sharing one parent context.
	async fn labels(&self, requests: &[(TreePath<E>, Option<String>)], context: &ViewContext) -> Vec<SourceResult<Label>> {
		let mut out = Vec::with_capacity(requests.len());
		for (path, column) in requests {
			out.push(self.label(path, context, column.as_deref()).await);
		}
		out
	}

	/// Creates a model proxy watching the element at `path` for changes.
	///
	/// Returning `None` means the element is not a subscription root. Proxies
	/// are installed and disposed strictly by INSTALL/UNINSTALL delta nodes.
	fn create_proxy(&self, path: &TreePath<E>, context: &ViewContext) -> Option<Box<dyn ModelProxy<E>>> {
		let _ = (path, context);
		None
	}
}

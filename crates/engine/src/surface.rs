use canopy_delta::{Element, TreePath};

use crate::source::Label;

/// Abstract viewer surface mutated by the coordinator.
///
/// Every method is fire-and-forget and is invoked only from the coordination
/// task, so implementations need no internal ordering. The few read-backs
/// (`child_at`, `expanded_paths`, `selected_paths`, `visible_range`) let the
/// coordinator diff fetched children against what is on screen and capture
/// expand/select state for the viewer state store.
pub trait ViewerSurface<E: Element>: Send {
	/// Replaces the viewer input. Clears all presented content.
	fn set_input(&mut self, input: Option<E>);

	/// Appends the element at `path` under its parent.
	fn add(&mut self, path: &TreePath<E>);

	/// Inserts the element at `path` at `index`, shifting later siblings.
	fn insert(&mut self, path: &TreePath<E>, index: usize);

	/// Replaces the slot `index` under `parent` with `element`, destroying
	/// whatever item occupied it.
	fn replace(&mut self, parent: &TreePath<E>, index: usize, element: &E);

	/// Updates the backing element of the item at `index` under `parent`
	/// without destroying the item.
	///
	/// Called for elements that are equal to what the slot already shows but
	/// may be different instances; preserves widget-level state such as
	/// selection and scroll position.
	fn remap(&mut self, parent: &TreePath<E>, index: usize, element: &E);

	/// Removes the element at `path`.
	fn remove(&mut self, path: &TreePath<E>);

	/// Marks every occurrence of `element` as needing re-presentation.
	fn refresh(&mut self, element: &E);

	/// Sets the (filter-adjusted) child count of the node at `path`.
	fn set_child_count(&mut self, path: &TreePath<E>, count: usize);

	/// Shows or hides the expander of the node at `path`.
	fn set_expandable(&mut self, path: &TreePath<E>, expandable: bool);

	/// Presents a label for one column of the node at `path`.
	fn set_label(&mut self, path: &TreePath<E>, column: Option<&str>, label: Label);

	/// Expands the node at `path`.
	fn expand(&mut self, path: &TreePath<E>);

	/// Collapses the node at `path`.
	fn collapse(&mut self, path: &TreePath<E>);

	/// Replaces the viewer selection. Applied at most once per delta.
	fn select(&mut self, paths: &[TreePath<E>]);

	/// The element currently presented at `index` under `parent`, if any.
	fn child_at(&self, parent: &TreePath<E>, index: usize) -> Option<E>;

	/// Paths of all currently expanded nodes.
	fn expanded_paths(&self) -> Vec<TreePath<E>>;

	/// Paths of all currently selected nodes.
	fn selected_paths(&self) -> Vec<TreePath<E>>;

	/// The child range of `path` worth materializing right now.
	///
	/// Virtual/windowed surfaces override this to keep population lazy; the
	/// default materializes every child.
	fn visible_range(&self, path: &TreePath<E>, count: usize) -> (usize, usize) {
		let _ = path;
		(0, count)
	}
}

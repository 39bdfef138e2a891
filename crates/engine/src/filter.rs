use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use canopy_delta::{Element, TreePath};

/// Element filter applied while children are materialized.
///
/// The predicate sees the parent path and the candidate child and returns
/// whether the child stays visible. Filtering happens at completion time, so
/// counts reported by the source are corrected on the surface once the
/// filtered slice is known.
pub struct ViewFilter<E> {
	predicate: Arc<dyn Fn(&TreePath<E>, &E) -> bool + Send + Sync>,
}

impl<E: Element> ViewFilter<E> {
	/// Wraps a keep-predicate.
	pub fn new(predicate: impl Fn(&TreePath<E>, &E) -> bool + Send + Sync + 'static) -> Self {
		Self { predicate: Arc::new(predicate) }
	}

	/// Whether `element` stays visible under `parent`.
	pub fn retains(&self, parent: &TreePath<E>, element: &E) -> bool {
		(self.predicate)(parent, element)
	}
}

impl<E> Clone for ViewFilter<E> {
	fn clone(&self) -> Self {
		Self {
			predicate: Arc::clone(&self.predicate),
		}
	}
}

/// Per-parent record of filtered-out model indices.
///
/// Maps model indices to view indices once children completions have been
/// filtered. Cleared per path when a child count resolves to 0 and wholesale
/// when the filter changes.
#[derive(Default)]
pub(crate) struct FilteredIndexCache<E> {
	hidden: HashMap<TreePath<E>, BTreeSet<usize>>,
}

impl<E: Element> FilteredIndexCache<E> {
	pub fn new() -> Self {
		Self { hidden: HashMap::new() }
	}

	/// Records that `model_index` under `parent` is filtered out.
	pub fn hide(&mut self, parent: &TreePath<E>, model_index: usize) {
		self.hidden.entry(parent.clone()).or_default().insert(model_index);
	}

	/// Records that `model_index` under `parent` is visible again.
	pub fn show(&mut self, parent: &TreePath<E>, model_index: usize) {
		if let Some(set) = self.hidden.get_mut(parent) {
			set.remove(&model_index);
			if set.is_empty() {
				self.hidden.remove(parent);
			}
		}
	}

	/// The view index of `model_index` under `parent`, `None` when hidden.
	pub fn view_index(&self, parent: &TreePath<E>, model_index: usize) -> Option<usize> {
		match self.hidden.get(parent) {
			None => Some(model_index),
			Some(set) if set.contains(&model_index) => None,
			Some(set) => Some(model_index - set.range(..model_index).count()),
		}
	}

	/// Filter-adjusted child count under `parent`.
	pub fn view_count(&self, parent: &TreePath<E>, model_count: usize) -> usize {
		match self.hidden.get(parent) {
			None => model_count,
			Some(set) => model_count - set.range(..model_count).count(),
		}
	}

	/// Drops the record for one parent.
	pub fn clear_path(&mut self, parent: &TreePath<E>) {
		self.hidden.remove(parent);
	}

	/// Drops records for a parent and every descendant.
	pub fn clear_subtree(&mut self, root: &TreePath<E>) {
		self.hidden.retain(|parent, _| !parent.starts_with(root));
	}

	/// Drops everything, e.g. on filter change.
	pub fn clear_all(&mut self) {
		self.hidden.clear();
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn view_indices_compact_around_hidden_slots() {
		let parent: TreePath<&str> = TreePath::root();
		let mut cache = FilteredIndexCache::new();
		cache.hide(&parent, 1);
		cache.hide(&parent, 3);
		assert_eq!(cache.view_index(&parent, 0), Some(0));
		assert_eq!(cache.view_index(&parent, 1), None);
		assert_eq!(cache.view_index(&parent, 2), Some(1));
		assert_eq!(cache.view_index(&parent, 3), None);
		assert_eq!(cache.view_index(&parent, 4), Some(2));
		assert_eq!(cache.view_count(&parent, 5), 3);
	}

	#[test]
	fn clearing_a_path_restores_identity_mapping() {
		let parent: TreePath<&str> = TreePath::root();
		let mut cache = FilteredIndexCache::new();
		cache.hide(&parent, 0);
		cache.clear_path(&parent);
		assert_eq!(cache.view_index(&parent, 0), Some(0));
	}
}

use std::fmt;
use std::sync::Arc;

/// Ordered element path from the viewer input down to one node.
///
/// The input itself is the empty path; a path of length `n` addresses a node `n`
/// levels below the input. Paths are cheaply cloneable (shared slice) and compare
/// by element value, which is what makes them usable as request and cache keys.
pub struct TreePath<E> {
	segments: Arc<[E]>,
}

impl<E: Clone> TreePath<E> {
	/// The empty path, addressing the viewer input.
	pub fn root() -> Self {
		Self { segments: Arc::from([]) }
	}

	/// Builds a path from root-to-node segments.
	pub fn from_segments(segments: impl Into<Vec<E>>) -> Self {
		Self {
			segments: segments.into().into(),
		}
	}

	/// Returns the path extended by one child element.
	pub fn child(&self, element: E) -> Self {
		let mut segments = Vec::with_capacity(self.segments.len() + 1);
		segments.extend_from_slice(&self.segments);
		segments.push(element);
		Self { segments: segments.into() }
	}

	/// Returns the parent path, or `None` for the root path.
	pub fn parent(&self) -> Option<Self> {
		match self.segments.len() {
			0 => None,
			n => Some(Self {
				segments: self.segments[..n - 1].to_vec().into(),
			}),
		}
	}

	/// Returns the last segment, or `None` for the root path.
	pub fn last(&self) -> Option<&E> {
		self.segments.last()
	}

	/// Number of segments below the input.
	pub fn len(&self) -> usize {
		self.segments.len()
	}

	/// Returns `true` for the empty (input) path.
	pub fn is_root(&self) -> bool {
		self.segments.is_empty()
	}

	/// Root-to-node segment slice.
	pub fn segments(&self) -> &[E] {
		&self.segments
	}
}

impl<E: PartialEq> TreePath<E> {
	/// Returns `true` if `prefix` is this path or an ancestor of it.
	pub fn starts_with(&self, prefix: &Self) -> bool {
		self.segments.len() >= prefix.segments.len() && self.segments[..prefix.segments.len()] == prefix.segments[..]
	}
}

impl<E> Clone for TreePath<E> {
	fn clone(&self) -> Self {
		Self {
			segments: Arc::clone(&self.segments),
		}
	}
}

impl<E: PartialEq> PartialEq for TreePath<E> {
	fn eq(&self, other: &Self) -> bool {
		self.segments == other.segments
	}
}

impl<E: Eq> Eq for TreePath<E> {}

impl<E: std::hash::Hash> std::hash::Hash for TreePath<E> {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.segments.hash(state);
	}
}

impl<E: fmt::Debug> fmt::Debug for TreePath<E> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_list().entries(self.segments.iter()).finish()
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn root_has_no_parent() {
		let root: TreePath<&str> = TreePath::root();
		assert!(root.is_root());
		assert_eq!(root.parent(), None);
		assert_eq!(root.last(), None);
	}

	#[test]
	fn child_and_parent_round_trip() {
		let path = TreePath::root().child("a").child("b");
		assert_eq!(path.len(), 2);
		assert_eq!(path.last(), Some(&"b"));
		assert_eq!(path.parent(), Some(TreePath::from_segments(vec!["a"])));
	}

	#[test]
	fn prefix_matching() {
		let parent = TreePath::from_segments(vec!["a"]);
		let node = parent.child("b");
		let other = TreePath::from_segments(vec!["x", "b"]);
		assert!(node.starts_with(&parent));
		assert!(node.starts_with(&node));
		assert!(parent.starts_with(&TreePath::root()));
		assert!(!node.starts_with(&other));
		assert!(!parent.starts_with(&node));
	}

	#[test]
	fn equality_is_by_value() {
		let a = TreePath::from_segments(vec![String::from("n")]);
		let b = TreePath::root().child(String::from("n"));
		assert_eq!(a, b);
	}
}

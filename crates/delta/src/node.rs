use thiserror::Error;

use crate::{DeltaFlags, Element, TreePath};

/// Handle to one node inside a [`Delta`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Errors raised while building a delta.
///
/// A malformed delta comes from a misbehaving model proxy; the coordinator logs
/// it and aborts application for the offending subtree only.
#[derive(Debug, Error)]
pub enum InvalidDeltaError {
	/// Two children claim the same slot under one parent without a replacement.
	#[error("parent already has a child at index {index}")]
	DuplicateIndex {
		/// The contested sibling index.
		index: usize,
	},

	/// A node handle does not belong to this delta.
	#[error("node id {0} is not part of this delta")]
	UnknownNode(usize),
}

/// Visitor control flow for [`Delta::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
	/// Continue into this node's children.
	Continue,
	/// Skip this node's children, continue with siblings.
	SkipChildren,
}

/// Depth-first pre-order delta visitor.
pub trait DeltaVisitor<E: Element> {
	/// Called once per node before its children, in insertion order.
	fn visit(&mut self, delta: &Delta<E>, node: NodeId) -> Visit;
}

impl<E: Element, F> DeltaVisitor<E> for F
where
	F: FnMut(&Delta<E>, NodeId) -> Visit,
{
	fn visit(&mut self, delta: &Delta<E>, node: NodeId) -> Visit {
		self(delta, node)
	}
}

struct NodeData<E> {
	element: E,
	flags: DeltaFlags,
	/// Sibling index, `None` when unknown.
	index: Option<usize>,
	/// Child count hint, `None` when unknown.
	child_count: Option<usize>,
	parent: Option<NodeId>,
	children: Vec<NodeId>,
}

/// Tree-shaped description of one backend model change.
///
/// Nodes live in an arena so the delta stays `Send` and can cross the
/// coordination ingress channel. Parent back-links are plain ids; children keep
/// insertion order, which is what makes index-based viewer operations replay in
/// the order they were recorded.
pub struct Delta<E> {
	nodes: Vec<NodeData<E>>,
}

impl<E: Element> Delta<E> {
	/// Creates a delta rooted at the viewer input element.
	pub fn new(root: E, flags: DeltaFlags) -> Self {
		Self {
			nodes: vec![NodeData {
				element: root,
				flags,
				index: None,
				child_count: None,
				parent: None,
				children: Vec::new(),
			}],
		}
	}

	/// The root node, standing for the viewer input.
	pub fn root(&self) -> NodeId {
		NodeId(0)
	}

	/// Appends a child node under `parent`.
	///
	/// Fails when `parent` already has a child at `index` and neither node is a
	/// replacement for the slot.
	pub fn add_node(
		&mut self,
		parent: NodeId,
		element: E,
		index: Option<usize>,
		flags: DeltaFlags,
		child_count: Option<usize>,
	) -> Result<NodeId, InvalidDeltaError> {
		let parent_data = self.nodes.get(parent.0).ok_or(InvalidDeltaError::UnknownNode(parent.0))?;
		if let Some(index) = index
			&& !flags.intersects(DeltaFlags::REPLACED | DeltaFlags::REMOVED)
		{
			for &child in &parent_data.children {
				let child_data = &self.nodes[child.0];
				if child_data.index == Some(index) && !child_data.flags.intersects(DeltaFlags::REPLACED | DeltaFlags::REMOVED) {
					return Err(InvalidDeltaError::DuplicateIndex { index });
				}
			}
		}
		let id = NodeId(self.nodes.len());
		self.nodes.push(NodeData {
			element,
			flags,
			index,
			child_count,
			parent: Some(parent),
			children: Vec::new(),
		});
		self.nodes[parent.0].children.push(id);
		Ok(id)
	}

	/// Merges `flags` into the node's existing flags.
	pub fn add_flags(&mut self, node: NodeId, flags: DeltaFlags) {
		if let Some(data) = self.nodes.get_mut(node.0) {
			data.flags |= flags;
		}
	}

	/// The node's element identity.
	pub fn element(&self, node: NodeId) -> &E {
		&self.nodes[node.0].element
	}

	/// The node's change flags.
	pub fn flags(&self, node: NodeId) -> DeltaFlags {
		self.nodes[node.0].flags
	}

	/// The node's sibling index, `None` when unknown.
	pub fn index(&self, node: NodeId) -> Option<usize> {
		self.nodes[node.0].index
	}

	/// The node's child count hint, `None` when unknown.
	pub fn child_count(&self, node: NodeId) -> Option<usize> {
		self.nodes[node.0].child_count
	}

	/// The node's parent, `None` at the root.
	pub fn parent(&self, node: NodeId) -> Option<NodeId> {
		self.nodes[node.0].parent
	}

	/// The node's children in insertion order.
	pub fn children(&self, node: NodeId) -> &[NodeId] {
		&self.nodes[node.0].children
	}

	/// Depth-first pre-order traversal with skip-branch control.
	pub fn accept<V: DeltaVisitor<E>>(&self, visitor: &mut V) {
		self.accept_from(self.root(), visitor);
	}

	fn accept_from<V: DeltaVisitor<E>>(&self, node: NodeId, visitor: &mut V) {
		if visitor.visit(self, node) == Visit::SkipChildren {
			return;
		}
		for &child in &self.nodes[node.0].children {
			self.accept_from(child, visitor);
		}
	}

	/// Reconstructs the path from the root to `node` by following parent links.
	///
	/// The root element itself is the viewer input and is not part of the path,
	/// so `tree_path(root)` is the empty path. O(depth).
	pub fn tree_path(&self, node: NodeId) -> TreePath<E> {
		let mut segments = Vec::new();
		let mut cursor = node;
		while let Some(parent) = self.nodes[cursor.0].parent {
			segments.push(self.nodes[cursor.0].element.clone());
			cursor = parent;
		}
		segments.reverse();
		TreePath::from_segments(segments)
	}
}

impl<E: Element> std::fmt::Debug for Delta<E> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		struct Entry<'a, E: Element>(&'a Delta<E>, NodeId);
		impl<E: Element> std::fmt::Debug for Entry<'_, E> {
			fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
				let Entry(delta, node) = *self;
				let mut dbg = f.debug_struct("Node");
				dbg.field("element", delta.element(node)).field("flags", &delta.flags(node));
				if let Some(index) = delta.index(node) {
					dbg.field("index", &index);
				}
				let children: Vec<Entry<'_, E>> = delta.children(node).iter().map(|&c| Entry(delta, c)).collect();
				if !children.is_empty() {
					dbg.field("children", &children);
				}
				dbg.finish()
			}
		}
		f.debug_tuple("Delta").field(&Entry(self, self.root())).finish()
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn content(element: &str) -> (String, DeltaFlags) {
		(element.to_string(), DeltaFlags::CONTENT)
	}

	#[test]
	fn add_node_links_parent_and_children() {
		let (root, flags) = content("root");
		let mut delta = Delta::new(root, flags);
		let a = delta.add_node(delta.root(), "a".to_string(), Some(0), DeltaFlags::ADDED, None).unwrap();
		let b = delta.add_node(delta.root(), "b".to_string(), Some(1), DeltaFlags::ADDED, None).unwrap();
		assert_eq!(delta.children(delta.root()), &[a, b]);
		assert_eq!(delta.parent(a), Some(delta.root()));
		assert_eq!(delta.parent(delta.root()), None);
	}

	#[test]
	fn duplicate_index_is_rejected() {
		let (root, flags) = content("root");
		let mut delta = Delta::new(root, flags);
		delta.add_node(delta.root(), "a".to_string(), Some(0), DeltaFlags::ADDED, None).unwrap();
		let err = delta.add_node(delta.root(), "b".to_string(), Some(0), DeltaFlags::ADDED, None).unwrap_err();
		assert!(matches!(err, InvalidDeltaError::DuplicateIndex { index: 0 }));
	}

	#[test]
	fn replacement_may_reuse_an_index() {
		let (root, flags) = content("root");
		let mut delta = Delta::new(root, flags);
		delta.add_node(delta.root(), "old".to_string(), Some(1), DeltaFlags::REMOVED, None).unwrap();
		delta.add_node(delta.root(), "new".to_string(), Some(1), DeltaFlags::ADDED, None).unwrap();
	}

	#[test]
	fn accept_is_preorder_and_skips_branches() {
		let mut delta = Delta::new("root".to_string(), DeltaFlags::NO_CHANGE);
		let a = delta.add_node(delta.root(), "a".to_string(), Some(0), DeltaFlags::CONTENT, None).unwrap();
		delta.add_node(a, "a1".to_string(), Some(0), DeltaFlags::CONTENT, None).unwrap();
		let b = delta.add_node(delta.root(), "b".to_string(), Some(1), DeltaFlags::CONTENT, None).unwrap();
		delta.add_node(b, "b1".to_string(), Some(0), DeltaFlags::CONTENT, None).unwrap();

		let mut seen = Vec::new();
		delta.accept(&mut |d: &Delta<String>, n: NodeId| {
			seen.push(d.element(n).clone());
			if d.element(n) == "a" { Visit::SkipChildren } else { Visit::Continue }
		});
		assert_eq!(seen, vec!["root", "a", "b", "b1"]);
	}

	#[test]
	fn tree_path_excludes_the_root_element() {
		let mut delta = Delta::new("root".to_string(), DeltaFlags::NO_CHANGE);
		let a = delta.add_node(delta.root(), "a".to_string(), None, DeltaFlags::CONTENT, None).unwrap();
		let a1 = delta.add_node(a, "a1".to_string(), None, DeltaFlags::CONTENT, None).unwrap();
		assert_eq!(delta.tree_path(delta.root()), TreePath::root());
		assert_eq!(delta.tree_path(a1), TreePath::from_segments(vec!["a".to_string(), "a1".to_string()]));
	}
}

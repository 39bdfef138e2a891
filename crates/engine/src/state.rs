use std::collections::HashMap;
use std::num::NonZeroUsize;

use canopy_delta::{Delta, DeltaFlags, Element, NodeId, TreePath, Visit};
use lru::LruCache;

use crate::source::{ContentSource, StateToken, ViewContext};

/// Default number of input mementos retained.
pub(crate) const DEFAULT_MEMENTO_CAPACITY: usize = 20;

/// One node of a saved expand/select memento.
///
/// Mirrors the EXPAND/SELECT-flagged nodes of the delta it was captured from,
/// with every element replaced by its opaque encoded token.
#[derive(Debug, Clone)]
pub struct MementoNode {
	/// Encoded element identity.
	pub token: StateToken,
	/// EXPAND/SELECT subset recorded for the element.
	pub flags: DeltaFlags,
	/// Child mementos in recorded order.
	pub children: Vec<MementoNode>,
}

impl MementoNode {
	/// Total number of nodes in this memento.
	pub fn node_count(&self) -> usize {
		1 + self.children.iter().map(MementoNode::node_count).sum::<usize>()
	}
}

/// Bounded LRU of expand/select mementos keyed by the encoded root input.
///
/// Eviction is silent: lost history re-expands nothing, which is a UX
/// affordance, not a correctness problem. Owned exclusively by the
/// coordination task.
pub(crate) struct ViewerStateStore {
	mementos: LruCache<StateToken, MementoNode>,
}

impl ViewerStateStore {
	pub fn new(capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
		Self {
			mementos: LruCache::new(capacity),
		}
	}

	/// Stores a memento under its own root token, evicting the oldest entry
	/// on overflow.
	pub fn put(&mut self, memento: MementoNode) {
		let token = memento.token.clone();
		if let Some((evicted, _)) = self.mementos.push(token, memento) {
			tracing::trace!(token = evicted.as_str(), "state.memento.evicted");
		}
	}

	/// Consumes the memento for `token`, if one is stored.
	pub fn take(&mut self, token: &StateToken) -> Option<MementoNode> {
		self.mementos.pop(token)
	}

	pub fn len(&self) -> usize {
		self.mementos.len()
	}
}

/// Encodes a save delta into a memento, all-or-nothing.
///
/// Every node's element is encoded by the content source; if any encoding
/// fails the partial memento is discarded and `None` is returned.
pub(crate) async fn encode_delta<E: Element>(
	source: &dyn ContentSource<E>,
	context: &ViewContext,
	delta: &Delta<E>,
) -> Option<MementoNode> {
	let mut order: Vec<NodeId> = Vec::new();
	delta.accept(&mut |_: &Delta<E>, node: NodeId| {
		order.push(node);
		Visit::Continue
	});

	let mut tokens: HashMap<NodeId, StateToken> = HashMap::with_capacity(order.len());
	for node in order {
		match source.encode_element(delta.element(node), context).await {
			Ok(token) => {
				tokens.insert(node, token);
			}
			Err(error) => {
				tracing::debug!(%error, element = ?delta.element(node), "state.save.discarded");
				return None;
			}
		}
	}

	fn build<E: Element>(delta: &Delta<E>, tokens: &HashMap<NodeId, StateToken>, node: NodeId) -> MementoNode {
		MementoNode {
			token: tokens[&node].clone(),
			flags: delta.flags(node) & (DeltaFlags::EXPAND | DeltaFlags::SELECT),
			children: delta.children(node).iter().map(|&child| build(delta, tokens, child)).collect(),
		}
	}
	Some(build(delta, &tokens, delta.root()))
}

struct RestoreNode {
	token: StateToken,
	flags: DeltaFlags,
	children: Vec<usize>,
	resolved: bool,
}

/// Step returned when a restore node matches a live element.
pub(crate) struct ResolvedStep {
	pub flags: DeltaFlags,
}

/// Replay state for one memento being restored against a fresh input.
///
/// The root is resolved up front (its token matched during lookup); deeper
/// nodes resolve as children completions arrive and compare positively against
/// their recorded tokens. Each node resolves at most once.
pub(crate) struct RestoreJob<E: Element> {
	pub root_token: StateToken,
	nodes: Vec<RestoreNode>,
	/// Resolved parent path → unresolved child memento nodes expected there.
	by_parent: HashMap<TreePath<E>, Vec<usize>>,
	/// Selection accumulated from SELECT-flagged matches.
	pub selection: Vec<TreePath<E>>,
	unresolved: usize,
}

impl<E: Element> RestoreJob<E> {
	pub fn new(memento: MementoNode) -> Self {
		let root_token = memento.token.clone();
		let mut nodes = Vec::with_capacity(memento.node_count());
		let root = flatten(memento, &mut nodes);
		nodes[root].resolved = true;
		let mut by_parent = HashMap::new();
		let root_children = nodes[root].children.clone();
		let unresolved = nodes.len() - 1;
		if !root_children.is_empty() {
			by_parent.insert(TreePath::root(), root_children);
		}
		Self {
			root_token,
			nodes,
			by_parent,
			selection: Vec::new(),
			unresolved,
		}
	}

	/// Unresolved memento nodes expected among the children of `parent`.
	pub fn candidates_under(&self, parent: &TreePath<E>) -> Vec<(usize, StateToken)> {
		let Some(ids) = self.by_parent.get(parent) else {
			return Vec::new();
		};
		ids.iter()
			.filter(|&&id| !self.nodes[id].resolved)
			.map(|&id| (id, self.nodes[id].token.clone()))
			.collect()
	}

	/// Marks `node` as matched at `path`.
	///
	/// Returns `None` when the node was already resolved (a second positive
	/// compare must not replay the step again).
	pub fn resolve(&mut self, node: usize, path: &TreePath<E>) -> Option<ResolvedStep> {
		if self.nodes.get(node).is_none_or(|n| n.resolved) {
			return None;
		}
		self.nodes[node].resolved = true;
		self.unresolved -= 1;
		let children = self.nodes[node].children.clone();
		if !children.is_empty() {
			self.by_parent.insert(path.clone(), children);
		}
		Some(ResolvedStep {
			flags: self.nodes[node].flags,
		})
	}

	/// Whether every memento node has been replayed.
	pub fn is_complete(&self) -> bool {
		self.unresolved == 0
	}
}

fn flatten(memento: MementoNode, nodes: &mut Vec<RestoreNode>) -> usize {
	let id = nodes.len();
	nodes.push(RestoreNode {
		token: memento.token,
		flags: memento.flags,
		children: Vec::new(),
		resolved: false,
	});
	let children: Vec<usize> = memento.children.into_iter().map(|child| flatten(child, nodes)).collect();
	nodes[id].children = children;
	id
}

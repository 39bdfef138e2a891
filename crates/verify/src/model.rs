use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canopy_delta::{Delta, DeltaFlags, TreePath};
use canopy_engine::{ContentSource, ContentSourceError, DeltaSender, KindClass, Label, ModelProxy, SourceResult, StateToken, ViewContext};
use parking_lot::Mutex;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Test element: equal by name, distinguishable by instance.
///
/// Two elements with the same name are *the same model element* for paths,
/// coalescing, and state restore, while the serial tells tests whether the
/// viewer kept an old instance or adopted a fresh one (the remap-vs-replace
/// distinction).
#[derive(Clone)]
pub struct TestElement {
	name: Arc<str>,
	serial: u64,
}

impl TestElement {
	/// Fresh instance named `name`.
	pub fn named(name: impl Into<Arc<str>>) -> Self {
		Self {
			name: name.into(),
			serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Instance-unique serial; survives clones, differs across `named` calls.
	pub fn serial(&self) -> u64 {
		self.serial
	}
}

impl PartialEq for TestElement {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name
	}
}

impl Eq for TestElement {}

impl std::hash::Hash for TestElement {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.name.hash(state);
	}
}

impl fmt::Debug for TestElement {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}#{}", self.name, self.serial)
	}
}

/// Builds a path from element names.
pub fn test_path(names: &[&str]) -> TreePath<TestElement> {
	TreePath::from_segments(names.iter().map(|name| TestElement::named(*name)).collect::<Vec<_>>())
}

fn path_key(path: &TreePath<TestElement>) -> String {
	if path.is_root() {
		return "/".to_string();
	}
	let mut key = String::new();
	for segment in path.segments() {
		key.push('/');
		key.push_str(segment.name());
	}
	key
}

struct ModelNode {
	element: TestElement,
	children: Vec<ModelNode>,
}

impl ModelNode {
	fn find(&self, path: &TreePath<TestElement>) -> Option<&ModelNode> {
		let mut node = self;
		for segment in path.segments() {
			node = node.children.iter().find(|child| child.element == *segment)?;
		}
		Some(node)
	}

	fn find_by_names_mut(&mut self, names: &[&str]) -> Option<&mut ModelNode> {
		let mut node = self;
		for name in names {
			node = node.children.iter_mut().find(|child| child.element.name() == *name)?;
		}
		Some(node)
	}
}

struct Inner {
	root: ModelNode,
	latency: Option<Duration>,
	batchable: HashSet<KindClass>,
	proxies_enabled: bool,
	queries: HashMap<(String, KindClass), usize>,
	batch_calls: usize,
	sender: Option<DeltaSender<TestElement>>,
	proxy_events: Vec<String>,
}

/// Mutable in-memory tree answering content source queries.
///
/// Mutations go through [`Self::add`]/[`Self::remove`]-style methods, each of
/// which returns the delta describing its own change, ready to hand to the
/// coordinator. Every query is counted per (path, kind class) so tests can
/// assert that coalescing collapsed duplicates.
pub struct TestModel {
	inner: Arc<Mutex<Inner>>,
}

impl Clone for TestModel {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl TestModel {
	pub fn new(root_name: &str) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner {
				root: ModelNode {
					element: TestElement::named(root_name),
					children: Vec::new(),
				},
				latency: None,
				batchable: HashSet::new(),
				proxies_enabled: false,
				queries: HashMap::new(),
				batch_calls: 0,
				sender: None,
				proxy_events: Vec::new(),
			})),
		}
	}

	/// The root element, used as the viewer input.
	pub fn root(&self) -> TestElement {
		self.inner.lock().root.element.clone()
	}

	/// Delays every query by `latency`, widening the windows where coalescing
	/// and cancellation can be observed.
	pub fn set_latency(&self, latency: Duration) {
		self.inner.lock().latency = Some(latency);
	}

	/// Declares `class` batchable across siblings.
	pub fn enable_batching(&self, class: KindClass) {
		self.inner.lock().batchable.insert(class);
	}

	/// Makes [`ContentSource::create_proxy`] hand out a recording proxy.
	pub fn enable_proxies(&self) {
		self.inner.lock().proxies_enabled = true;
	}

	/// The element at `names`, if present.
	pub fn element(&self, names: &[&str]) -> Option<TestElement> {
		let inner = self.inner.lock();
		let mut node = &inner.root;
		for name in names {
			node = node.children.iter().find(|child| child.element.name() == *name)?;
		}
		Some(node.element.clone())
	}

	/// Adds a fresh child named `name` under `parent`; returns the ADDED delta.
	pub fn add(&self, parent: &[&str], name: &str) -> Delta<TestElement> {
		let element = TestElement::named(name);
		{
			let mut inner = self.inner.lock();
			if let Some(node) = inner.root.find_by_names_mut(parent) {
				node.children.push(ModelNode {
					element: element.clone(),
					children: Vec::new(),
				});
			}
		}
		let mut names: Vec<&str> = parent.to_vec();
		names.push(name);
		self.delta_for(&names, DeltaFlags::ADDED)
	}

	/// Inserts a fresh child named `name` at `index` under `parent`; returns
	/// the ADDED delta carrying the position.
	pub fn add_at(&self, parent: &[&str], name: &str, index: usize) -> Delta<TestElement> {
		let element = TestElement::named(name);
		{
			let mut inner = self.inner.lock();
			if let Some(node) = inner.root.find_by_names_mut(parent) {
				let index = index.min(node.children.len());
				node.children.insert(index, ModelNode {
					element: element.clone(),
					children: Vec::new(),
				});
			}
		}
		let mut names: Vec<&str> = parent.to_vec();
		names.push(name);
		self.delta_at(&names, DeltaFlags::ADDED, Some(index))
	}

	/// Removes the node at `names`; returns the REMOVED delta.
	pub fn remove(&self, names: &[&str]) -> Delta<TestElement> {
		let delta = self.delta_for(names, DeltaFlags::REMOVED);
		if let Some((last, parent)) = names.split_last() {
			let mut inner = self.inner.lock();
			if let Some(node) = inner.root.find_by_names_mut(parent) {
				node.children.retain(|child| child.element.name() != *last);
			}
		}
		delta
	}

	/// Returns a CONTENT delta for the node at `names`.
	pub fn refresh(&self, names: &[&str]) -> Delta<TestElement> {
		self.delta_for(names, DeltaFlags::CONTENT)
	}

	/// Returns an EXPAND delta for the node at `names`.
	pub fn expand(&self, names: &[&str]) -> Delta<TestElement> {
		self.delta_for(names, DeltaFlags::EXPAND)
	}

	/// Returns a SELECT delta for the node at `names`.
	pub fn select(&self, names: &[&str]) -> Delta<TestElement> {
		self.delta_for(names, DeltaFlags::SELECT)
	}

	/// Returns an INSTALL delta for the node at `names`.
	pub fn install(&self, names: &[&str]) -> Delta<TestElement> {
		self.delta_for(names, DeltaFlags::INSTALL)
	}

	/// Returns an UNINSTALL delta for the node at `names`.
	pub fn uninstall(&self, names: &[&str]) -> Delta<TestElement> {
		self.delta_for(names, DeltaFlags::UNINSTALL)
	}

	/// How many queries of `class` were answered for the node at `names`.
	pub fn query_count(&self, names: &[&str], class: KindClass) -> usize {
		let key = if names.is_empty() {
			"/".to_string()
		} else {
			format!("/{}", names.join("/"))
		};
		self.inner.lock().queries.get(&(key, class)).copied().unwrap_or(0)
	}

	/// How many batched source calls were answered.
	pub fn batch_call_count(&self) -> usize {
		self.inner.lock().batch_calls
	}

	/// The delta sender handed to the last installed proxy.
	pub fn proxy_sender(&self) -> Option<DeltaSender<TestElement>> {
		self.inner.lock().sender.clone()
	}

	/// Install/dispose events in occurrence order.
	pub fn proxy_events(&self) -> Vec<String> {
		self.inner.lock().proxy_events.clone()
	}

	/// Builds a delta carrying `flags` on the node at `names`, with a
	/// NO_CHANGE spine from the root down to it.
	fn delta_for(&self, names: &[&str], flags: DeltaFlags) -> Delta<TestElement> {
		self.delta_at(names, flags, None)
	}

	fn delta_at(&self, names: &[&str], flags: DeltaFlags, index: Option<usize>) -> Delta<TestElement> {
		let inner = self.inner.lock();
		let mut chain = Vec::with_capacity(names.len());
		let mut node = &inner.root;
		for name in names {
			match node.children.iter().find(|child| child.element.name() == *name) {
				Some(child) => {
					chain.push(child.element.clone());
					node = child;
				}
				// Unknown name: stand in a fresh element so removal deltas can
				// still be built for nodes already gone from the model.
				None => chain.push(TestElement::named(*name)),
			}
		}
		let mut delta = Delta::new(inner.root.element.clone(), DeltaFlags::NO_CHANGE);
		let mut parent = delta.root();
		let last = chain.len().saturating_sub(1);
		for (i, element) in chain.into_iter().enumerate() {
			let node_flags = if i == last { flags } else { DeltaFlags::NO_CHANGE };
			let node_index = if i == last { index } else { None };
			match delta.add_node(parent, element, node_index, node_flags, None) {
				Ok(node) => parent = node,
				Err(_) => break,
			}
		}
		if names.is_empty() {
			delta.add_flags(delta.root(), flags);
		}
		delta
	}

	async fn pause(&self) {
		let latency = self.inner.lock().latency;
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}
	}

	fn count_query(&self, path: &TreePath<TestElement>, class: KindClass) {
		let key = path_key(path);
		*self.inner.lock().queries.entry((key, class)).or_insert(0) += 1;
	}
}

#[async_trait]
impl ContentSource<TestElement> for TestModel {
	async fn has_children(&self, path: &TreePath<TestElement>, _context: &ViewContext) -> SourceResult<bool> {
		self.pause().await;
		self.count_query(path, KindClass::HasChildren);
		let inner = self.inner.lock();
		let node = inner.root.find(path).ok_or(ContentSourceError::Gone)?;
		Ok(!node.children.is_empty())
	}

	async fn child_count(&self, path: &TreePath<TestElement>, _context: &ViewContext) -> SourceResult<usize> {
		self.pause().await;
		self.count_query(path, KindClass::ChildCount);
		let inner = self.inner.lock();
		let node = inner.root.find(path).ok_or(ContentSourceError::Gone)?;
		Ok(node.children.len())
	}

	async fn children(&self, path: &TreePath<TestElement>, _context: &ViewContext, offset: usize, length: usize) -> SourceResult<Vec<TestElement>> {
		self.pause().await;
		self.count_query(path, KindClass::Children);
		let inner = self.inner.lock();
		let node = inner.root.find(path).ok_or(ContentSourceError::Gone)?;
		let end = (offset + length).min(node.children.len());
		let start = offset.min(end);
		Ok(node.children[start..end].iter().map(|child| child.element.clone()).collect())
	}

	async fn label(&self, path: &TreePath<TestElement>, _context: &ViewContext, column: Option<&str>) -> SourceResult<Label> {
		self.pause().await;
		self.count_query(path, KindClass::Label);
		let inner = self.inner.lock();
		let node = inner.root.find(path).ok_or(ContentSourceError::Gone)?;
		let name = node.element.name();
		Ok(match column {
			Some(column) => Label::text(format!("{name} [{column}]")),
			None => Label::text(name),
		})
	}

	async fn encode_element(&self, element: &TestElement, _context: &ViewContext) -> SourceResult<StateToken> {
		self.pause().await;
		Ok(StateToken::new(element.name().to_string()))
	}

	async fn compare_element(&self, candidate: &TestElement, token: &StateToken, _context: &ViewContext) -> SourceResult<bool> {
		Ok(candidate.name() == token.as_str())
	}

	fn supports_batching(&self, kind: KindClass) -> bool {
		self.inner.lock().batchable.contains(&kind)
	}

	async fn child_counts(&self, paths: &[TreePath<TestElement>], _context: &ViewContext) -> Vec<SourceResult<usize>> {
		self.pause().await;
		let mut inner = self.inner.lock();
		inner.batch_calls += 1;
		let mut out = Vec::with_capacity(paths.len());
		for path in paths {
			*inner.queries.entry((path_key(path), KindClass::ChildCount)).or_insert(0) += 1;
			out.push(inner.root.find(path).map(|node| node.children.len()).ok_or(ContentSourceError::Gone));
		}
		out
	}

	async fn labels(&self, requests: &[(TreePath<TestElement>, Option<String>)], _context: &ViewContext) -> Vec<SourceResult<Label>> {
		self.pause().await;
		let mut inner = self.inner.lock();
		inner.batch_calls += 1;
		let mut out = Vec::with_capacity(requests.len());
		for (path, column) in requests {
			*inner.queries.entry((path_key(path), KindClass::Label)).or_insert(0) += 1;
			out.push(inner.root.find(path).map_or(Err(ContentSourceError::Gone), |node| {
				let name = node.element.name();
				Ok(match column {
					Some(column) => Label::text(format!("{name} [{column}]")),
					None => Label::text(name),
				})
			}));
		}
		out
	}

	fn create_proxy(&self, path: &TreePath<TestElement>, _context: &ViewContext) -> Option<Box<dyn ModelProxy<TestElement>>> {
		if !self.inner.lock().proxies_enabled {
			return None;
		}
		Some(Box::new(TestProxy {
			model: self.clone(),
			path: path_key(path),
		}))
	}
}

/// Proxy that records its lifecycle and parks the sender on the model.
struct TestProxy {
	model: TestModel,
	path: String,
}

impl ModelProxy<TestElement> for TestProxy {
	fn installed(&mut self, sender: DeltaSender<TestElement>) {
		let mut inner = self.model.inner.lock();
		inner.sender = Some(sender);
		inner.proxy_events.push(format!("installed {}", self.path));
	}

	fn disposed(&mut self) {
		let mut inner = self.model.inner.lock();
		inner.sender = None;
		inner.proxy_events.push(format!("disposed {}", self.path));
	}
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use canopy_delta::TreePath;
use canopy_engine::{Label, ViewerSurface};
use parking_lot::Mutex;

use crate::model::TestElement;

/// One viewer operation, with paths rendered as `/name/name` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceOp {
	SetInput(Option<String>),
	Add(String),
	Insert(String, usize),
	Replace(String, usize, String),
	Remap(String, usize, String),
	Remove(String),
	Refresh(String),
	SetChildCount(String, usize),
	SetExpandable(String, bool),
	SetLabel(String, Option<String>, String),
	Expand(String),
	Collapse(String),
	Select(Vec<String>),
}

fn render(path: &TreePath<TestElement>) -> String {
	if path.is_root() {
		return "/".to_string();
	}
	let mut out = String::new();
	for segment in path.segments() {
		out.push('/');
		out.push_str(segment.name());
	}
	out
}

#[derive(Default)]
struct SurfaceState {
	input: Option<TestElement>,
	children: HashMap<TreePath<TestElement>, Vec<TestElement>>,
	expanded: HashSet<TreePath<TestElement>>,
	selected: Vec<TreePath<TestElement>>,
	expandable: HashMap<String, bool>,
	counts: HashMap<String, usize>,
	labels: HashMap<(String, Option<String>), Label>,
	ops: Vec<SurfaceOp>,
}

impl SurfaceState {
	fn drop_subtree(&mut self, root: &TreePath<TestElement>) {
		self.children.retain(|path, _| !path.starts_with(root));
		self.expanded.retain(|path| !path.starts_with(root));
	}
}

/// Surface double that mirrors the presented tree and logs every operation.
///
/// Clones share state, so tests keep one handle for assertions and box another
/// for the coordinator.
pub struct RecordingSurface {
	state: Arc<Mutex<SurfaceState>>,
}

impl Clone for RecordingSurface {
	fn clone(&self) -> Self {
		Self { state: Arc::clone(&self.state) }
	}
}

impl Default for RecordingSurface {
	fn default() -> Self {
		Self::new()
	}
}

impl RecordingSurface {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(SurfaceState::default())),
		}
	}

	/// Every operation applied so far, in order.
	pub fn ops(&self) -> Vec<SurfaceOp> {
		self.state.lock().ops.clone()
	}

	pub fn input(&self) -> Option<TestElement> {
		self.state.lock().input.clone()
	}

	/// The presented children of the node at `names`.
	pub fn children_of(&self, names: &[&str]) -> Vec<TestElement> {
		let path = crate::model::test_path(names);
		self.state.lock().children.get(&path).cloned().unwrap_or_default()
	}

	/// Names of the presented children of the node at `names`.
	pub fn child_names(&self, names: &[&str]) -> Vec<String> {
		self.children_of(names).iter().map(|element| element.name().to_string()).collect()
	}

	pub fn is_expanded(&self, names: &[&str]) -> bool {
		let path = crate::model::test_path(names);
		self.state.lock().expanded.contains(&path)
	}

	/// Rendered paths of the current selection.
	pub fn selected(&self) -> Vec<String> {
		self.state.lock().selected.iter().map(render).collect()
	}

	pub fn label_text(&self, names: &[&str], column: Option<&str>) -> Option<String> {
		let key = (render(&crate::model::test_path(names)), column.map(str::to_string));
		self.state.lock().labels.get(&key).map(|label| label.text.clone())
	}

	pub fn child_count_of(&self, names: &[&str]) -> Option<usize> {
		self.state.lock().counts.get(&render(&crate::model::test_path(names))).copied()
	}

	pub fn is_expandable(&self, names: &[&str]) -> Option<bool> {
		self.state.lock().expandable.get(&render(&crate::model::test_path(names))).copied()
	}

	fn push(&self, op: SurfaceOp) {
		self.state.lock().ops.push(op);
	}
}

impl ViewerSurface<TestElement> for RecordingSurface {
	fn set_input(&mut self, input: Option<TestElement>) {
		let mut state = self.state.lock();
		state.children.clear();
		state.expanded.clear();
		state.selected.clear();
		state.expandable.clear();
		state.counts.clear();
		state.labels.clear();
		let rendered = input.as_ref().map(|element| element.name().to_string());
		state.input = input;
		state.ops.push(SurfaceOp::SetInput(rendered));
	}

	fn add(&mut self, path: &TreePath<TestElement>) {
		let Some(element) = path.last().cloned() else { return };
		let parent = path.parent().unwrap_or_else(TreePath::root);
		let mut state = self.state.lock();
		state.children.entry(parent).or_default().push(element);
		state.ops.push(SurfaceOp::Add(render(path)));
	}

	fn insert(&mut self, path: &TreePath<TestElement>, index: usize) {
		let Some(element) = path.last().cloned() else { return };
		let parent = path.parent().unwrap_or_else(TreePath::root);
		let mut state = self.state.lock();
		let slots = state.children.entry(parent).or_default();
		let index = index.min(slots.len());
		slots.insert(index, element);
		state.ops.push(SurfaceOp::Insert(render(path), index));
	}

	fn replace(&mut self, parent: &TreePath<TestElement>, index: usize, element: &TestElement) {
		let mut state = self.state.lock();
		if let Some(old) = state.children.get(parent).and_then(|slots| slots.get(index)).cloned() {
			let old_path = parent.child(old);
			state.drop_subtree(&old_path);
		}
		if let Some(slot) = state.children.get_mut(parent).and_then(|slots| slots.get_mut(index)) {
			*slot = element.clone();
		}
		state.ops.push(SurfaceOp::Replace(render(parent), index, element.name().to_string()));
	}

	fn remap(&mut self, parent: &TreePath<TestElement>, index: usize, element: &TestElement) {
		let mut state = self.state.lock();
		if let Some(slot) = state.children.get_mut(parent).and_then(|slots| slots.get_mut(index)) {
			*slot = element.clone();
		}
		state.ops.push(SurfaceOp::Remap(render(parent), index, element.name().to_string()));
	}

	fn remove(&mut self, path: &TreePath<TestElement>) {
		let Some(element) = path.last().cloned() else { return };
		let parent = path.parent().unwrap_or_else(TreePath::root);
		let mut state = self.state.lock();
		if let Some(slots) = state.children.get_mut(&parent)
			&& let Some(index) = slots.iter().position(|slot| *slot == element)
		{
			slots.remove(index);
		}
		state.drop_subtree(path);
		state.selected.retain(|selected| !selected.starts_with(path));
		state.ops.push(SurfaceOp::Remove(render(path)));
	}

	fn refresh(&mut self, element: &TestElement) {
		self.push(SurfaceOp::Refresh(element.name().to_string()));
	}

	fn set_child_count(&mut self, path: &TreePath<TestElement>, count: usize) {
		let mut state = self.state.lock();
		state.counts.insert(render(path), count);
		// Virtual-tree semantics: surplus trailing slots go away with the count.
		if let Some(slots) = state.children.get_mut(path)
			&& slots.len() > count
		{
			slots.truncate(count);
		}
		state.ops.push(SurfaceOp::SetChildCount(render(path), count));
	}

	fn set_expandable(&mut self, path: &TreePath<TestElement>, expandable: bool) {
		let mut state = self.state.lock();
		state.expandable.insert(render(path), expandable);
		state.ops.push(SurfaceOp::SetExpandable(render(path), expandable));
	}

	fn set_label(&mut self, path: &TreePath<TestElement>, column: Option<&str>, label: Label) {
		let mut state = self.state.lock();
		state.ops.push(SurfaceOp::SetLabel(render(path), column.map(str::to_string), label.text.clone()));
		state.labels.insert((render(path), column.map(str::to_string)), label);
	}

	fn expand(&mut self, path: &TreePath<TestElement>) {
		let mut state = self.state.lock();
		state.expanded.insert(path.clone());
		state.ops.push(SurfaceOp::Expand(render(path)));
	}

	fn collapse(&mut self, path: &TreePath<TestElement>) {
		let mut state = self.state.lock();
		state.expanded.remove(path);
		state.ops.push(SurfaceOp::Collapse(render(path)));
	}

	fn select(&mut self, paths: &[TreePath<TestElement>]) {
		let mut state = self.state.lock();
		state.selected = paths.to_vec();
		state.ops.push(SurfaceOp::Select(paths.iter().map(render).collect()));
	}

	fn child_at(&self, parent: &TreePath<TestElement>, index: usize) -> Option<TestElement> {
		self.state.lock().children.get(parent).and_then(|slots| slots.get(index)).cloned()
	}

	fn expanded_paths(&self) -> Vec<TreePath<TestElement>> {
		self.state.lock().expanded.iter().cloned().collect()
	}

	fn selected_paths(&self) -> Vec<TreePath<TestElement>> {
		self.state.lock().selected.clone()
	}
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use canopy_delta::{Delta, DeltaFlags, DeltaVisitor, Element, InvalidDeltaError, NodeId, TreePath, Visit};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::ContentSourceError;
use crate::filter::{FilteredIndexCache, ViewFilter};
use crate::observer::{CoordinatorObserver, ObserverList};
use crate::proxy::{DeltaSender, ModelProxy};
use crate::queue::{Batch, BatchOutcome, QueryOutcome, ScheduleOutcome, UpdateQueue};
use crate::request::{KindClass, RequestDescriptor, RequestKey, UpdateKind};
use crate::source::{ContentSource, Label, StateToken, ViewContext};
use crate::state::{self, MementoNode, RestoreJob, ViewerStateStore};
use crate::surface::ViewerSurface;

/// Construction-time knobs of a [`TreeCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
	/// Maximum content source calls in flight at once.
	pub worker_limit: usize,
	/// Number of expand/select mementos retained across input swaps.
	pub memento_capacity: usize,
}

impl Default for CoordinatorOptions {
	fn default() -> Self {
		Self {
			worker_limit: 8,
			memento_capacity: state::DEFAULT_MEMENTO_CAPACITY,
		}
	}
}

/// Coordination ingress messages.
///
/// Public handle commands and worker completions travel through the same
/// single-consumer queue, which is what serializes all access to the pending
/// table, the memento store, and the viewer surface.
pub(crate) enum Msg<E: Element> {
	ApplyDelta(Delta<E>),
	SetInput(Option<E>),
	Expand(TreePath<E>, i32),
	Collapse(TreePath<E>),
	SetFilter(Option<ViewFilter<E>>),
	AddObserver(Arc<dyn CoordinatorObserver<E>>),
	BatchDone(BatchOutcome<E>),
	StateSaved(MementoNode),
	RestoreLookup {
		generation: u64,
		token: StateToken,
	},
	Compared {
		generation: u64,
		node: usize,
		path: TreePath<E>,
		matched: bool,
	},
}

/// Handle to one tree view's coordination actor.
///
/// Constructed per tree view and passed by reference; there is no process-wide
/// registry. All methods are fire-and-forget sends into the coordination
/// queue. Dropping every handle (or calling [`Self::shutdown`]) stops the
/// actor; messages sent afterwards are silently discarded.
pub struct TreeCoordinator<E: Element> {
	tx: mpsc::UnboundedSender<Msg<E>>,
	cancel: CancellationToken,
}

impl<E: Element> Clone for TreeCoordinator<E> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
			cancel: self.cancel.clone(),
		}
	}
}

impl<E: Element> TreeCoordinator<E> {
	/// Spawns the coordination actor for `surface` fed by `source`.
	///
	/// Must be called within a tokio runtime.
	pub fn spawn(
		source: Arc<dyn ContentSource<E>>,
		surface: Box<dyn ViewerSurface<E>>,
		context: ViewContext,
		options: CoordinatorOptions,
	) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let cancel = CancellationToken::new();
		let task = CoordinatorTask {
			source,
			surface,
			context: Arc::new(context),
			tx: tx.clone(),
			queue: UpdateQueue::new(),
			observers: ObserverList::new(),
			workers: Arc::new(Semaphore::new(options.worker_limit.max(1))),
			input: None,
			counts: HashMap::new(),
			expanded: HashSet::new(),
			auto_expand: HashMap::new(),
			filter: None,
			filtered: FilteredIndexCache::new(),
			store: ViewerStateStore::new(options.memento_capacity),
			restore: None,
			restore_generation: 0,
			proxies: HashMap::new(),
			sequence_open: false,
		};
		tokio::spawn(task.run(rx, cancel.clone()));
		Self { tx, cancel }
	}

	/// Delivers a model change.
	pub fn apply_delta(&self, delta: Delta<E>) {
		self.send(Msg::ApplyDelta(delta));
	}

	/// Replaces the viewer input, saving the old input's expand/select state
	/// and restoring the new input's, if a matching memento exists.
	pub fn set_input(&self, input: Option<E>) {
		self.send(Msg::SetInput(input));
	}

	/// Expands the node at `path` one level.
	pub fn expand(&self, path: TreePath<E>) {
		self.send(Msg::Expand(path, 1));
	}

	/// Expands the node at `path` and `levels - 1` levels below it; `-1`
	/// expands without bound.
	pub fn expand_to_level(&self, path: TreePath<E>, levels: i32) {
		self.send(Msg::Expand(path, levels));
	}

	/// Collapses the node at `path`.
	pub fn collapse(&self, path: TreePath<E>) {
		self.send(Msg::Collapse(path));
	}

	/// Installs or clears the element filter. Triggers a refresh from the
	/// root because cached filtered indices are no longer valid.
	pub fn set_filter(&self, filter: Option<ViewFilter<E>>) {
		self.send(Msg::SetFilter(filter));
	}

	/// Subscribes a protocol observer.
	pub fn add_observer(&self, observer: Arc<dyn CoordinatorObserver<E>>) {
		self.send(Msg::AddObserver(observer));
	}

	/// Stops the coordination actor. In-flight content source calls finish
	/// but their completions are dropped.
	pub fn shutdown(&self) {
		self.cancel.cancel();
	}

	fn send(&self, msg: Msg<E>) {
		if self.tx.send(msg).is_err() {
			tracing::trace!("coordinator.command.dropped_after_shutdown");
		}
	}
}

struct CoordinatorTask<E: Element> {
	source: Arc<dyn ContentSource<E>>,
	surface: Box<dyn ViewerSurface<E>>,
	context: Arc<ViewContext>,
	tx: mpsc::UnboundedSender<Msg<E>>,
	queue: UpdateQueue<E>,
	observers: ObserverList<E>,
	workers: Arc<Semaphore>,
	input: Option<E>,
	/// Last known model child count per path.
	counts: HashMap<TreePath<E>, usize>,
	expanded: HashSet<TreePath<E>>,
	/// Remaining auto-expand depth per expanded path; `-1` is unbounded.
	auto_expand: HashMap<TreePath<E>, i32>,
	filter: Option<ViewFilter<E>>,
	filtered: FilteredIndexCache<E>,
	store: ViewerStateStore,
	restore: Option<RestoreJob<E>>,
	/// Bumped whenever a restore is started or abandoned, so late compare
	/// results from an older job are ignored.
	restore_generation: u64,
	proxies: HashMap<TreePath<E>, Box<dyn ModelProxy<E>>>,
	sequence_open: bool,
}

/// Applies one delta node-by-node, accumulating SELECT paths so the selection
/// is set once per delta instead of flickering node-by-node.
struct DeltaApplier<'a, E: Element> {
	task: &'a mut CoordinatorTask<E>,
	selection: Vec<TreePath<E>>,
}

impl<E: Element> DeltaVisitor<E> for DeltaApplier<'_, E> {
	fn visit(&mut self, delta: &Delta<E>, node: NodeId) -> Visit {
		self.task.apply_flags(delta, node, &mut self.selection)
	}
}

impl<E: Element> CoordinatorTask<E> {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg<E>>, cancel: CancellationToken) {
		loop {
			let msg = tokio::select! {
				_ = cancel.cancelled() => break,
				msg = rx.recv() => match msg {
					Some(msg) => msg,
					None => break,
				},
			};
			self.handle(msg);
			self.dispatch_ready();
			self.settle_sequence();
		}
		for (_, mut proxy) in self.proxies.drain() {
			proxy.disposed();
		}
		tracing::debug!("coordinator.stopped");
	}

	fn handle(&mut self, msg: Msg<E>) {
		match msg {
			Msg::ApplyDelta(delta) => self.apply_delta(delta),
			Msg::SetInput(input) => self.set_input(input),
			Msg::Expand(path, levels) => self.expand_path(&path, levels),
			Msg::Collapse(path) => {
				self.surface.collapse(&path);
				self.expanded.remove(&path);
				self.auto_expand.retain(|p, _| !p.starts_with(&path));
			}
			Msg::SetFilter(filter) => self.set_filter(filter),
			Msg::AddObserver(observer) => self.observers.add(observer),
			Msg::BatchDone(outcome) => self.batch_done(outcome),
			Msg::StateSaved(memento) => {
				let token = memento.token.clone();
				tracing::debug!(token = token.as_str(), nodes = memento.node_count(), "state.save.stored");
				self.store.put(memento);
				self.observers.notify(|observer| observer.on_state_saved(&token));
			}
			Msg::RestoreLookup { generation, token } => self.restore_lookup(generation, token),
			Msg::Compared {
				generation,
				node,
				path,
				matched,
			} => self.compared(generation, node, path, matched),
		}
	}

	// --- delta application -------------------------------------------------

	fn apply_delta(&mut self, delta: Delta<E>) {
		if self.input.as_ref() != Some(delta.element(delta.root())) {
			tracing::debug!("coordinator.delta.ignored_foreign_root");
			return;
		}
		tracing::trace!(delta = ?delta, "coordinator.delta.apply");
		self.observers.notify(|observer| observer.on_model_changed(&delta));
		let mut applier = DeltaApplier { task: self, selection: Vec::new() };
		delta.accept(&mut applier);
		let selection = applier.selection;
		if !selection.is_empty() {
			self.surface.select(&selection);
		}
	}

	/// Applies one node's flags in the fixed protocol order, before the
	/// traversal recurses into the node's children.
	fn apply_flags(&mut self, delta: &Delta<E>, node: NodeId, selection: &mut Vec<TreePath<E>>) -> Visit {
		let flags = delta.flags(node);
		let path = delta.tree_path(node);

		if flags.contains(DeltaFlags::ADDED) {
			if path.is_root() {
				tracing::warn!("coordinator.delta.invalid: ADDED on the input element");
				return Visit::SkipChildren;
			}
			self.added(&path, delta.element(node), delta.index(node));
		}
		if flags.contains(DeltaFlags::REMOVED) {
			self.removed(&path);
			return Visit::SkipChildren;
		}
		if flags.contains(DeltaFlags::CONTENT) {
			self.surface.refresh(delta.element(node));
			self.counts.remove(&path);
			self.schedule(path.clone(), UpdateKind::ChildCount);
		}
		if flags.contains(DeltaFlags::EXPAND) {
			self.expand_path(&path, 1);
		}
		if flags.contains(DeltaFlags::SELECT) {
			selection.push(path.clone());
		}
		if flags.contains(DeltaFlags::STATE) {
			self.schedule_labels(&path);
		}
		if flags.contains(DeltaFlags::INSERTED) {
			if path.is_root() {
				tracing::warn!("coordinator.delta.invalid: INSERTED on the input element");
				return Visit::SkipChildren;
			}
			self.added(&path, delta.element(node), delta.index(node));
		}
		if flags.contains(DeltaFlags::REPLACED) {
			match delta.index(node) {
				Some(index) => self.replaced(&path, delta.element(node), index),
				None => {
					tracing::warn!("coordinator.delta.invalid: REPLACED without an index");
					return Visit::SkipChildren;
				}
			}
		}
		if flags.contains(DeltaFlags::INSTALL) {
			self.install_proxy(&path);
		}
		if flags.contains(DeltaFlags::UNINSTALL) {
			if let Some(mut proxy) = self.proxies.remove(&path) {
				proxy.disposed();
			}
		}
		Visit::Continue
	}

	fn added(&mut self, path: &TreePath<E>, element: &E, index: Option<usize>) {
		let parent = path.parent().unwrap_or_else(TreePath::root);
		let hidden = self.filter.as_ref().is_some_and(|filter| !filter.retains(&parent, element));
		if hidden {
			return;
		}
		match index {
			Some(index) => self.surface.insert(path, index),
			None => self.surface.add(path),
		}
		if let Some(count) = self.counts.get_mut(&parent) {
			*count += 1;
		}
		self.schedule(path.clone(), UpdateKind::HasChildren);
		self.schedule_labels(path);
	}

	fn removed(&mut self, path: &TreePath<E>) {
		// Rescheduling: in-flight queries into the removed subtree are
		// invalidated; cancel them and re-query the parent's post-removal
		// state. A late completion of a canceled query is a no-op.
		let canceled = self.queue.cancel_subtree(path);
		self.notify_canceled(canceled);
		self.surface.remove(path);
		self.cleanup_subtree(path);
		let parent = path.parent().unwrap_or_else(TreePath::root);
		if let Some(count) = self.counts.get_mut(&parent)
			&& *count > 0
		{
			*count -= 1;
		}
		self.schedule(parent, UpdateKind::ChildCount);
	}

	fn replaced(&mut self, path: &TreePath<E>, element: &E, index: usize) {
		let parent = path.parent().unwrap_or_else(TreePath::root);
		if let Some(old) = self.surface.child_at(&parent, index) {
			let old_path = parent.child(old);
			let canceled = self.queue.cancel_subtree(&old_path);
			self.notify_canceled(canceled);
			self.cleanup_subtree(&old_path);
		}
		self.surface.replace(&parent, index, element);
		self.schedule(path.clone(), UpdateKind::HasChildren);
		self.schedule_labels(path);
	}

	// --- input & state save/restore ----------------------------------------

	fn set_input(&mut self, input: Option<E>) {
		if let Some(old) = self.input.take() {
			self.save_state(old);
		}
		let canceled = self.queue.cancel_all();
		self.notify_canceled(canceled);
		for (_, mut proxy) in self.proxies.drain() {
			proxy.disposed();
		}
		self.counts.clear();
		self.expanded.clear();
		self.auto_expand.clear();
		self.filtered.clear_all();
		self.restore = None;
		self.restore_generation += 1;
		self.surface.set_input(input.clone());
		self.input = input.clone();

		let Some(new_input) = input else { return };
		self.schedule(TreePath::root(), UpdateKind::ChildCount);
		let source = Arc::clone(&self.source);
		let context = Arc::clone(&self.context);
		let tx = self.tx.clone();
		let generation = self.restore_generation;
		tokio::spawn(async move {
			match source.encode_element(&new_input, &context).await {
				Ok(token) => {
					let _ = tx.send(Msg::RestoreLookup { generation, token });
				}
				Err(error) => tracing::debug!(%error, "state.restore.lookup_skipped"),
			}
		});
	}

	/// Captures the old input's expand/select state as a delta and encodes it
	/// off-thread. Saving is all-or-nothing: the encode worker discards the
	/// memento if any element fails to encode.
	fn save_state(&mut self, old: E) {
		let expanded = self.surface.expanded_paths();
		let selected = self.surface.selected_paths();
		if expanded.is_empty() && selected.is_empty() {
			return;
		}
		let mut delta = Delta::new(old, DeltaFlags::NO_CHANGE);
		let mut nodes: HashMap<TreePath<E>, NodeId> = HashMap::new();
		nodes.insert(TreePath::root(), delta.root());
		let record = |paths: Vec<TreePath<E>>, flag: DeltaFlags, delta: &mut Delta<E>, nodes: &mut HashMap<TreePath<E>, NodeId>| {
			for path in paths {
				match ensure_node(delta, nodes, &path) {
					Ok(node) => delta.add_flags(node, flag),
					Err(error) => tracing::debug!(%error, "state.save.path_skipped"),
				}
			}
		};
		record(expanded, DeltaFlags::EXPAND, &mut delta, &mut nodes);
		record(selected, DeltaFlags::SELECT, &mut delta, &mut nodes);

		let source = Arc::clone(&self.source);
		let context = Arc::clone(&self.context);
		let tx = self.tx.clone();
		tokio::spawn(async move {
			if let Some(memento) = state::encode_delta(source.as_ref(), &context, &delta).await {
				let _ = tx.send(Msg::StateSaved(memento));
			}
		});
	}

	fn restore_lookup(&mut self, generation: u64, token: StateToken) {
		// An encode outliving its set_input must not consume the memento of
		// whatever input is current now.
		if generation != self.restore_generation || self.input.is_none() {
			tracing::trace!(token = token.as_str(), "state.restore.lookup_stale");
			return;
		}
		let Some(memento) = self.store.take(&token) else {
			tracing::trace!(token = token.as_str(), "state.restore.no_memento");
			return;
		};
		tracing::debug!(token = token.as_str(), nodes = memento.node_count(), "state.restore.started");
		let job = RestoreJob::new(memento);
		let root_token = job.root_token.clone();
		self.restore = Some(job);
		self.restore_generation += 1;
		self.observers.notify(|observer| observer.on_state_restore_started(&root_token));
		// Children of the root may already be on the surface; advance against
		// them instead of waiting for the next completion.
		self.readvance_restore(&TreePath::root());
	}

	/// Feeds already-materialized children of `parent` into the restore job.
	fn readvance_restore(&mut self, parent: &TreePath<E>) {
		let mut existing = Vec::new();
		let mut index = 0;
		while let Some(element) = self.surface.child_at(parent, index) {
			existing.push(element);
			index += 1;
		}
		if !existing.is_empty() {
			self.advance_restore(parent, &existing);
		}
	}

	/// Pending-restore advancement: spawn compare queries for every memento
	/// node expected under `parent` against the freshly-known children.
	fn advance_restore(&mut self, parent: &TreePath<E>, children: &[E]) {
		let Some(job) = &self.restore else { return };
		let candidates = job.candidates_under(parent);
		if candidates.is_empty() {
			return;
		}
		let generation = self.restore_generation;
		for (node, token) in candidates {
			for element in children {
				let source = Arc::clone(&self.source);
				let context = Arc::clone(&self.context);
				let tx = self.tx.clone();
				let token = token.clone();
				let element = element.clone();
				let path = parent.child(element.clone());
				tokio::spawn(async move {
					let matched = source.compare_element(&element, &token, &context).await.unwrap_or(false);
					let _ = tx.send(Msg::Compared {
						generation,
						node,
						path,
						matched,
					});
				});
			}
		}
	}

	fn compared(&mut self, generation: u64, node: usize, path: TreePath<E>, matched: bool) {
		if generation != self.restore_generation || !matched {
			return;
		}
		let step = match self.restore.as_mut() {
			Some(job) => job.resolve(node, &path),
			None => return,
		};
		if let Some(step) = step {
			tracing::trace!(path = ?path, flags = ?step.flags, "state.restore.step");
			if step.flags.contains(DeltaFlags::EXPAND) {
				self.expand_path(&path, 1);
			}
			if step.flags.contains(DeltaFlags::SELECT)
				&& let Some(job) = self.restore.as_mut()
			{
				job.selection.push(path.clone());
				let selection = job.selection.clone();
				self.surface.select(&selection);
			}
		}
		if let Some(job) = self.restore.take_if(|job| job.is_complete()) {
			tracing::debug!(token = job.root_token.as_str(), "state.restore.complete");
			self.observers.notify(|observer| observer.on_state_restored(&job.root_token));
		}
	}

	// --- expansion, filtering ----------------------------------------------

	fn expand_path(&mut self, path: &TreePath<E>, levels: i32) {
		if levels == 0 {
			return;
		}
		if !path.is_root() && self.expanded.insert(path.clone()) {
			self.surface.expand(path);
		}
		if levels != 1 {
			self.auto_expand.insert(path.clone(), levels);
		}
		match self.counts.get(path).copied() {
			Some(0) => {}
			Some(count) => self.request_children(path, count),
			None => self.schedule(path.clone(), UpdateKind::ChildCount),
		}
	}

	fn set_filter(&mut self, filter: Option<ViewFilter<E>>) {
		self.filter = filter;
		self.filtered.clear_all();
		if self.input.is_none() {
			return;
		}
		self.counts.clear();
		self.schedule(TreePath::root(), UpdateKind::ChildCount);
		for path in self.surface.expanded_paths() {
			self.schedule(path, UpdateKind::ChildCount);
		}
	}

	// --- completions --------------------------------------------------------

	fn batch_done(&mut self, outcome: BatchOutcome<E>) {
		for (descriptor, result) in self.queue.resolve_batch(outcome) {
			match result {
				QueryOutcome::Canceled => {
					tracing::trace!(id = descriptor.id, "coordinator.completion.canceled_live");
					continue;
				}
				QueryOutcome::HasChildren(result) => self.has_children_done(&descriptor.path, result),
				QueryOutcome::ChildCount(result) => self.child_count_done(&descriptor.path, result),
				QueryOutcome::Children(result) => {
					let offset = match descriptor.kind {
						UpdateKind::Children { offset, .. } => offset,
						_ => 0,
					};
					self.children_done(&descriptor.path, offset, result);
				}
				QueryOutcome::Label(result) => {
					let column = match &descriptor.kind {
						UpdateKind::Label { column } => column.clone(),
						_ => None,
					};
					self.label_done(&descriptor.path, column.as_deref(), result);
				}
			}
			self.observers.notify(|observer| observer.on_request_complete(&descriptor, false));
		}
	}

	fn has_children_done(&mut self, path: &TreePath<E>, result: Result<bool, ContentSourceError>) {
		match result {
			Ok(has_children) => {
				self.surface.set_expandable(path, has_children);
				if has_children && self.expanded.contains(path) && !self.counts.contains_key(path) {
					self.schedule(path.clone(), UpdateKind::ChildCount);
				}
			}
			Err(error) => {
				tracing::warn!(%error, path = ?path, "coordinator.has_children.failed");
				self.surface.set_expandable(path, false);
			}
		}
	}

	fn child_count_done(&mut self, path: &TreePath<E>, result: Result<usize, ContentSourceError>) {
		match result {
			Ok(0) => {
				self.counts.insert(path.clone(), 0);
				self.filtered.clear_path(path);
				self.surface.set_child_count(path, 0);
				self.surface.set_expandable(path, false);
			}
			Ok(count) => {
				self.counts.insert(path.clone(), count);
				self.surface.set_child_count(path, self.filtered.view_count(path, count));
				self.surface.set_expandable(path, true);
				if self.should_populate(path) {
					self.request_children(path, count);
				}
			}
			Err(error) => {
				// Count stays unknown; degrade the node instead of crashing
				// the traversal.
				tracing::warn!(%error, path = ?path, "coordinator.child_count.failed");
				self.counts.remove(path);
				self.surface.set_expandable(path, false);
			}
		}
	}

	fn children_done(&mut self, path: &TreePath<E>, offset: usize, result: Result<Vec<E>, ContentSourceError>) {
		let elements = match result {
			Ok(elements) => elements,
			Err(error) => {
				tracing::warn!(%error, path = ?path, "coordinator.children.failed");
				return;
			}
		};
		let filter = self.filter.clone();
		let incoming: HashSet<&E> = elements.iter().collect();
		// An auto-expand budget drives exactly one populate wave; a later
		// refetch of the same path must not re-expand collapsed nodes.
		let budget = self.auto_expand.remove(path);
		let mut kept = Vec::with_capacity(elements.len());
		for (i, element) in elements.iter().enumerate() {
			let model_index = offset + i;
			if let Some(filter) = &filter {
				if !filter.retains(path, element) {
					self.filtered.hide(path, model_index);
					continue;
				}
				self.filtered.show(path, model_index);
			}
			let Some(view_index) = self.filtered.view_index(path, model_index) else {
				continue;
			};
			let child_path = path.child(element.clone());
			match self.surface.child_at(path, view_index) {
				// Unchanged but possibly a different instance: remap the
				// backing element, keep the item and its widget state.
				Some(existing) if existing == *element => self.surface.remap(path, view_index, element),
				Some(existing) => {
					// Cancel the outgoing subtree only when the element is
					// leaving the view entirely, not merely changing slots.
					if !incoming.contains(&existing) {
						let old_path = path.child(existing);
						let canceled = self.queue.cancel_subtree(&old_path);
						self.notify_canceled(canceled);
						self.cleanup_subtree(&old_path);
					}
					self.surface.replace(path, view_index, element);
				}
				None => self.surface.insert(&child_path, view_index),
			}
			kept.push(element.clone());
			self.schedule(child_path.clone(), UpdateKind::HasChildren);
			self.schedule_labels(&child_path);
			if let Some(budget) = budget {
				let below = if budget < 0 { budget } else { budget - 1 };
				if below != 0 {
					self.expand_path(&child_path, below);
				}
			}
		}
		if let Some(count) = self.counts.get(path).copied() {
			self.surface.set_child_count(path, self.filtered.view_count(path, count));
		}
		self.advance_restore(path, &kept);
	}

	fn label_done(&mut self, path: &TreePath<E>, column: Option<&str>, result: Result<Label, ContentSourceError>) {
		match result {
			Ok(label) => self.surface.set_label(path, column, label),
			Err(error) => {
				tracing::debug!(%error, path = ?path, "coordinator.label.failed");
				self.surface.set_label(path, column, Label::error(error.to_string()));
			}
		}
	}

	// --- scheduling & dispatch ----------------------------------------------

	fn should_populate(&self, path: &TreePath<E>) -> bool {
		path.is_root() || self.expanded.contains(path)
	}

	fn request_children(&mut self, path: &TreePath<E>, count: usize) {
		// Lazy/virtual population: only the visible window is fetched.
		let (offset, length) = self.surface.visible_range(path, count);
		if length > 0 {
			self.schedule(path.clone(), UpdateKind::Children { offset, length });
		}
	}

	fn schedule(&mut self, path: TreePath<E>, kind: UpdateKind) {
		let was_idle = self.queue.outstanding() == 0;
		match self.queue.schedule(RequestKey::new(path, kind)) {
			ScheduleOutcome::New(descriptor) => {
				if was_idle && !self.sequence_open {
					self.sequence_open = true;
					self.observers.notify(|observer| observer.on_sequence_begin());
				}
				self.observers.notify(|observer| observer.on_request_started(&descriptor));
			}
			ScheduleOutcome::Coalesced(_) => {}
		}
	}

	fn schedule_labels(&mut self, path: &TreePath<E>) {
		if self.context.columns.is_empty() {
			self.schedule(path.clone(), UpdateKind::Label { column: None });
			return;
		}
		let columns = self.context.columns.clone();
		for column in columns {
			self.schedule(path.clone(), UpdateKind::Label { column: Some(column) });
		}
	}

	fn dispatch_ready(&mut self) {
		let source = Arc::clone(&self.source);
		let batches = self.queue.take_ready_batches(|class| source.supports_batching(class));
		for batch in batches {
			self.spawn_batch(batch);
		}
	}

	fn spawn_batch(&self, batch: Batch<E>) {
		let source = Arc::clone(&self.source);
		let context = Arc::clone(&self.context);
		let tx = self.tx.clone();
		let workers = Arc::clone(&self.workers);
		tokio::spawn(async move {
			let _permit = match workers.acquire_owned().await {
				Ok(permit) => permit,
				Err(_) => return,
			};
			let outcome = run_batch(source.as_ref(), &context, batch).await;
			let _ = tx.send(Msg::BatchDone(outcome));
		});
	}

	fn settle_sequence(&mut self) {
		if self.sequence_open && self.queue.outstanding() == 0 {
			self.sequence_open = false;
			self.observers.notify(|observer| observer.on_sequence_complete());
		}
	}

	fn notify_canceled(&self, canceled: Vec<RequestDescriptor<E>>) {
		for descriptor in canceled {
			self.observers.notify(|observer| observer.on_request_complete(&descriptor, true));
		}
	}

	fn cleanup_subtree(&mut self, path: &TreePath<E>) {
		self.counts.retain(|p, _| !p.starts_with(path));
		self.expanded.retain(|p| !p.starts_with(path));
		self.auto_expand.retain(|p, _| !p.starts_with(path));
		self.filtered.clear_subtree(path);
	}

	fn install_proxy(&mut self, path: &TreePath<E>) {
		if self.proxies.contains_key(path) {
			return;
		}
		if let Some(mut proxy) = self.source.create_proxy(path, &self.context) {
			proxy.installed(DeltaSender::new(self.tx.clone()));
			self.proxies.insert(path.clone(), proxy);
		}
	}
}

fn ensure_node<E: Element>(delta: &mut Delta<E>, nodes: &mut HashMap<TreePath<E>, NodeId>, path: &TreePath<E>) -> Result<NodeId, InvalidDeltaError> {
	if let Some(&node) = nodes.get(path) {
		return Ok(node);
	}
	let parent_path = path.parent().unwrap_or_else(TreePath::root);
	let parent = ensure_node(delta, nodes, &parent_path)?;
	let Some(element) = path.last().cloned() else {
		return Ok(delta.root());
	};
	let node = delta.add_node(parent, element, None, DeltaFlags::NO_CHANGE, None)?;
	nodes.insert(path.clone(), node);
	Ok(node)
}

/// Executes one batch against the content source on a worker task.
///
/// Batched classes go through the source's multi-element entry points in one
/// call; everything else runs request-by-request. Requests canceled before the
/// batch runs are answered with a `Canceled` outcome, which the queue discards.
async fn run_batch<E: Element>(source: &dyn ContentSource<E>, context: &ViewContext, batch: Batch<E>) -> BatchOutcome<E> {
	let canceled: Vec<bool> = batch.requests.iter().map(|request| request.cancel.is_cancelled()).collect();
	let mut items = Vec::with_capacity(batch.requests.len());
	match batch.class {
		KindClass::ChildCount if batch.requests.len() > 1 => {
			let paths: Vec<TreePath<E>> = batch
				.requests
				.iter()
				.zip(&canceled)
				.filter(|&(_, &canceled)| !canceled)
				.map(|(request, _)| request.key.path.clone())
				.collect();
			let mut results = source.child_counts(&paths, context).await.into_iter();
			for (request, canceled) in batch.requests.into_iter().zip(canceled) {
				let outcome = if canceled {
					QueryOutcome::Canceled
				} else {
					match results.next() {
						Some(result) => QueryOutcome::ChildCount(result),
						None => QueryOutcome::ChildCount(Err(ContentSourceError::query("batched count result missing"))),
					}
				};
				items.push((request.id, request.key, outcome));
			}
		}
		KindClass::Label if batch.requests.len() > 1 => {
			let pairs: Vec<(TreePath<E>, Option<String>)> = batch
				.requests
				.iter()
				.zip(&canceled)
				.filter(|&(_, &canceled)| !canceled)
				.map(|(request, _)| {
					let column = match &request.key.kind {
						UpdateKind::Label { column } => column.clone(),
						_ => None,
					};
					(request.key.path.clone(), column)
				})
				.collect();
			let mut results = source.labels(&pairs, context).await.into_iter();
			for (request, canceled) in batch.requests.into_iter().zip(canceled) {
				let outcome = if canceled {
					QueryOutcome::Canceled
				} else {
					match results.next() {
						Some(result) => QueryOutcome::Label(result),
						None => QueryOutcome::Label(Err(ContentSourceError::query("batched label result missing"))),
					}
				};
				items.push((request.id, request.key, outcome));
			}
		}
		_ => {
			for request in batch.requests {
				if request.cancel.is_cancelled() {
					items.push((request.id, request.key, QueryOutcome::Canceled));
					continue;
				}
				let outcome = match &request.key.kind {
					UpdateKind::HasChildren => QueryOutcome::HasChildren(source.has_children(&request.key.path, context).await),
					UpdateKind::ChildCount => QueryOutcome::ChildCount(source.child_count(&request.key.path, context).await),
					UpdateKind::Children { offset, length } => {
						QueryOutcome::Children(source.children(&request.key.path, context, *offset, *length).await)
					}
					UpdateKind::Label { column } => QueryOutcome::Label(source.label(&request.key.path, context, column.as_deref()).await),
				};
				items.push((request.id, request.key, outcome));
			}
		}
	}
	BatchOutcome {
		batch_id: batch.batch_id,
		scheduling_key: batch.scheduling_key,
		items,
	}
}

use std::collections::{HashMap, HashSet};

use canopy_delta::{Element, TreePath};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::error::SourceResult;
use crate::request::{KindClass, RequestDescriptor, RequestKey, UpdateState};
use crate::source::Label;

/// Completion payload for one request.
pub(crate) enum QueryOutcome<E> {
	HasChildren(SourceResult<bool>),
	ChildCount(SourceResult<usize>),
	Children(SourceResult<Vec<E>>),
	Label(SourceResult<Label>),
	/// The worker observed the cancellation signal and never ran the query.
	Canceled,
}

/// One request inside a dispatched batch.
pub(crate) struct BatchRequest<E> {
	pub id: u64,
	pub key: RequestKey<E>,
	pub cancel: CancellationToken,
}

/// A group of RUNNING requests handed to one worker invocation.
///
/// All requests share a scheduling key and a kind class; the worker invokes the
/// content source once per batch and posts one [`BatchOutcome`] back.
pub(crate) struct Batch<E> {
	pub batch_id: u64,
	pub scheduling_key: TreePath<E>,
	pub class: KindClass,
	pub requests: Vec<BatchRequest<E>>,
}

/// Worker-side result of one batch.
pub(crate) struct BatchOutcome<E> {
	pub batch_id: u64,
	pub scheduling_key: TreePath<E>,
	pub items: Vec<(u64, RequestKey<E>, QueryOutcome<E>)>,
}

/// Result of scheduling one request.
pub(crate) enum ScheduleOutcome<E> {
	/// A new request entered the table; observers should see it start.
	New(RequestDescriptor<E>),
	/// An equal request was already pending; the schedule coalesced into it.
	Coalesced(u64),
}

struct Pending {
	id: u64,
	state: UpdateState,
	coalesced: u32,
	cancel: CancellationToken,
}

/// Pending-request table: coalescing, readiness gating, and cancellation.
///
/// Owned exclusively by the coordination task. Insertion order doubles as
/// submission order, which is what keeps per-scheduling-key completions applied
/// in the order their requests were submitted.
pub(crate) struct UpdateQueue<E> {
	next_id: u64,
	next_batch: u64,
	pending: IndexMap<RequestKey<E>, Pending>,
	/// Scheduling keys with a batch in flight; one in-flight batch per key.
	in_flight: HashMap<TreePath<E>, u64>,
	/// Ids canceled while running; their completions must be discarded.
	stale: HashSet<u64>,
}

impl<E: Element> UpdateQueue<E> {
	pub fn new() -> Self {
		Self {
			next_id: 0,
			next_batch: 0,
			pending: IndexMap::new(),
			in_flight: HashMap::new(),
			stale: HashSet::new(),
		}
	}

	/// Number of outstanding (scheduled or running) requests.
	pub fn outstanding(&self) -> usize {
		self.pending.len()
	}

	/// Schedules a request, coalescing with an equal pending one.
	pub fn schedule(&mut self, key: RequestKey<E>) -> ScheduleOutcome<E> {
		if let Some(pending) = self.pending.get_mut(&key) {
			pending.coalesced += 1;
			tracing::trace!(id = pending.id, coalesced = pending.coalesced, kind = ?key.kind, "queue.request.coalesced");
			return ScheduleOutcome::Coalesced(pending.id);
		}
		self.next_id += 1;
		let id = self.next_id;
		let descriptor = RequestDescriptor {
			id,
			path: key.path.clone(),
			kind: key.kind.clone(),
			coalesced: 1,
		};
		self.pending.insert(key, Pending {
			id,
			state: UpdateState::Scheduled,
			coalesced: 1,
			cancel: CancellationToken::new(),
		});
		ScheduleOutcome::New(descriptor)
	}

	/// A request of `class` for `path` is gated while any lower-priority
	/// request for the same path is outstanding.
	fn gated(&self, path: &TreePath<E>, class: KindClass) -> bool {
		self.pending.keys().any(|other| other.kind.class() < class && other.path == *path)
	}

	/// Moves every SCHEDULED request with a ready scheduling key to RUNNING and
	/// groups them into batches.
	///
	/// A scheduling key is ready when no earlier batch for it is still in
	/// flight; requests of a batchable class sharing the key merge into one
	/// batch, others dispatch alone and leave their siblings queued.
	pub fn take_ready_batches(&mut self, batchable: impl Fn(KindClass) -> bool) -> Vec<Batch<E>> {
		let mut ready: Vec<RequestKey<E>> = self
			.pending
			.iter()
			.filter(|(key, pending)| pending.state == UpdateState::Scheduled && !self.gated(&key.path, key.kind.class()))
			.map(|(key, _)| key.clone())
			.collect();
		ready.sort_by_key(|key| key.kind.priority());

		let mut batches: Vec<Batch<E>> = Vec::new();
		let mut claimed: HashMap<TreePath<E>, usize> = HashMap::new();
		for key in ready {
			let scheduling_key = key.scheduling_key();
			if self.in_flight.contains_key(&scheduling_key) {
				continue;
			}
			let class = key.kind.class();
			let batch_index = match claimed.get(&scheduling_key) {
				Some(&index) => {
					let batch = &batches[index];
					if batch.class != class || !batchable(class) {
						continue;
					}
					index
				}
				None => {
					self.next_batch += 1;
					batches.push(Batch {
						batch_id: self.next_batch,
						scheduling_key: scheduling_key.clone(),
						class,
						requests: Vec::new(),
					});
					claimed.insert(scheduling_key.clone(), batches.len() - 1);
					batches.len() - 1
				}
			};
			let Some(pending) = self.pending.get_mut(&key) else { continue };
			pending.state = UpdateState::Running;
			batches[batch_index].requests.push(BatchRequest {
				id: pending.id,
				key,
				cancel: pending.cancel.clone(),
			});
		}
		for batch in &batches {
			self.in_flight.insert(batch.scheduling_key.clone(), batch.batch_id);
		}
		batches
	}

	/// Resolves a batch completion into the live requests it answers.
	///
	/// Stale items (canceled while the batch ran) are dropped here and never
	/// reach the surface.
	pub fn resolve_batch(&mut self, outcome: BatchOutcome<E>) -> Vec<(RequestDescriptor<E>, QueryOutcome<E>)> {
		if self.in_flight.get(&outcome.scheduling_key) == Some(&outcome.batch_id) {
			self.in_flight.remove(&outcome.scheduling_key);
		}
		let mut resolved = Vec::with_capacity(outcome.items.len());
		for (id, key, result) in outcome.items {
			if self.stale.remove(&id) {
				tracing::trace!(id, kind = ?key.kind, "queue.completion.stale_discarded");
				continue;
			}
			let Some(pending) = self.pending.get(&key) else {
				tracing::trace!(id, kind = ?key.kind, "queue.completion.unknown_discarded");
				continue;
			};
			if pending.id != id {
				// A rescheduled request reused the key; this answer belongs
				// to the canceled predecessor.
				tracing::trace!(id, current = pending.id, "queue.completion.superseded_discarded");
				continue;
			}
			let coalesced = pending.coalesced;
			self.pending.shift_remove(&key);
			resolved.push((
				RequestDescriptor {
					id,
					path: key.path,
					kind: key.kind,
					coalesced,
				},
				result,
			));
		}
		resolved
	}

	/// Cancels every pending request addressing `root` or a descendant.
	///
	/// Terminal for the canceled requests: running ones keep executing until
	/// they observe the token, but their completions are discarded.
	pub fn cancel_subtree(&mut self, root: &TreePath<E>) -> Vec<RequestDescriptor<E>> {
		let keys: Vec<RequestKey<E>> = self.pending.keys().filter(|key| key.path.starts_with(root)).cloned().collect();
		self.cancel_keys(keys)
	}

	/// Cancels everything, e.g. when the viewer input is replaced.
	pub fn cancel_all(&mut self) -> Vec<RequestDescriptor<E>> {
		let keys: Vec<RequestKey<E>> = self.pending.keys().cloned().collect();
		self.cancel_keys(keys)
	}

	fn cancel_keys(&mut self, keys: Vec<RequestKey<E>>) -> Vec<RequestDescriptor<E>> {
		let mut canceled = Vec::with_capacity(keys.len());
		for key in keys {
			let Some(pending) = self.pending.shift_remove(&key) else { continue };
			pending.cancel.cancel();
			if pending.state == UpdateState::Running {
				self.stale.insert(pending.id);
			}
			tracing::trace!(id = pending.id, kind = ?key.kind, "queue.request.canceled");
			canceled.push(RequestDescriptor {
				id: pending.id,
				path: key.path,
				kind: key.kind,
				coalesced: pending.coalesced,
			});
		}
		canceled
	}
}

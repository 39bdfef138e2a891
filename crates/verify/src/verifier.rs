use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canopy_delta::{Delta, Element, TreePath};
use canopy_engine::{CoordinatorObserver, KindClass, RequestDescriptor, StateToken, UpdateKind};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// A protocol guarantee the verifier saw broken, or a settle timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
	/// Sequence begin/complete events did not alternate.
	#[error("unbalanced sequence events: {0}")]
	UnbalancedSequence(String),

	/// Two live requests share one (path, kind) identity; coalescing failed.
	#[error("redundant request started: {0}")]
	RedundantRequest(String),

	/// A completion was applied while a lower-priority request for the same
	/// path was still outstanding.
	#[error("out-of-order completion: {0}")]
	OutOfOrderCompletion(String),

	/// The coordinator did not settle within the allotted time.
	#[error("coordinator did not settle within {0:?}: {1}")]
	Timeout(Duration, String),
}

struct VerifierState<E: Element> {
	/// Live requests by id, with their protocol identity.
	outstanding: HashMap<u64, (TreePath<E>, UpdateKind)>,
	started: HashMap<(TreePath<E>, KindClass), usize>,
	completed: usize,
	canceled: usize,
	sequence_open: bool,
	sequences_begun: usize,
	sequences_completed: usize,
	model_changes: usize,
	state_saves: usize,
	state_restores: usize,
	expected_sequences: usize,
	expected_model_changes: usize,
	expected_saves: usize,
	expected_restores: usize,
	violations: Vec<ProtocolViolation>,
}

impl<E: Element> VerifierState<E> {
	fn settled(&self) -> bool {
		self.outstanding.is_empty()
			&& !self.sequence_open
			&& self.sequences_completed >= self.expected_sequences
			&& self.model_changes >= self.expected_model_changes
			&& self.state_saves >= self.expected_saves
			&& self.state_restores >= self.expected_restores
	}

	fn progress(&self) -> String {
		format!(
			"outstanding={} sequences={}/{} model_changes={}/{} saves={}/{} restores={}/{}",
			self.outstanding.len(),
			self.sequences_completed,
			self.expected_sequences,
			self.model_changes,
			self.expected_model_changes,
			self.state_saves,
			self.expected_saves,
			self.state_restores,
			self.expected_restores,
		)
	}
}

/// Observer that checks the update protocol's guarantees on a live coordinator.
///
/// Attach one per coordinator, arm it with the activity a stimulus is expected
/// to produce (`expect_*`), deliver the stimulus, then [`Self::wait_settled`].
/// Arming first closes the race where the verifier would report "settled"
/// before the coordinator even received the stimulus.
pub struct ProtocolVerifier<E: Element> {
	state: Arc<Mutex<VerifierState<E>>>,
	notify: Arc<Notify>,
}

impl<E: Element> Clone for ProtocolVerifier<E> {
	fn clone(&self) -> Self {
		Self {
			state: Arc::clone(&self.state),
			notify: Arc::clone(&self.notify),
		}
	}
}

impl<E: Element> Default for ProtocolVerifier<E> {
	fn default() -> Self {
		Self::new()
	}
}

impl<E: Element> ProtocolVerifier<E> {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(VerifierState {
				outstanding: HashMap::new(),
				started: HashMap::new(),
				completed: 0,
				canceled: 0,
				sequence_open: false,
				sequences_begun: 0,
				sequences_completed: 0,
				model_changes: 0,
				state_saves: 0,
				state_restores: 0,
				expected_sequences: 0,
				expected_model_changes: 0,
				expected_saves: 0,
				expected_restores: 0,
				violations: Vec::new(),
			})),
			notify: Arc::new(Notify::new()),
		}
	}

	/// Requires `count` further completed update sequences before settling.
	pub fn expect_sequences(&self, count: usize) {
		self.state.lock().expected_sequences += count;
	}

	/// Requires `count` further observed deltas before settling.
	pub fn expect_model_changes(&self, count: usize) {
		self.state.lock().expected_model_changes += count;
	}

	/// Requires `count` further captured state mementos before settling.
	pub fn expect_state_saves(&self, count: usize) {
		self.state.lock().expected_saves += count;
	}

	/// Requires `count` further completed state restores before settling.
	pub fn expect_state_restores(&self, count: usize) {
		self.state.lock().expected_restores += count;
	}

	/// Waits until every armed expectation is met and no request is
	/// outstanding, or reports the first violation seen.
	pub async fn wait_settled(&self, timeout: Duration) -> Result<(), ProtocolViolation> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let notified = self.notify.notified();
			{
				let state = self.state.lock();
				if let Some(violation) = state.violations.first() {
					return Err(violation.clone());
				}
				if state.settled() {
					return Ok(());
				}
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				let progress = self.state.lock().progress();
				return Err(ProtocolViolation::Timeout(timeout, progress));
			}
		}
	}

	/// How many distinct requests of `class` were started for `path`.
	pub fn started_count(&self, path: &TreePath<E>, class: KindClass) -> usize {
		self.state.lock().started.get(&(path.clone(), class)).copied().unwrap_or(0)
	}

	/// (begun, completed) sequence event counts.
	pub fn sequences(&self) -> (usize, usize) {
		let state = self.state.lock();
		(state.sequences_begun, state.sequences_completed)
	}

	/// Total non-canceled completions observed.
	pub fn completed_count(&self) -> usize {
		self.state.lock().completed
	}

	/// Total cancellations observed.
	pub fn canceled_count(&self) -> usize {
		self.state.lock().canceled
	}

	/// Every violation recorded so far.
	pub fn violations(&self) -> Vec<ProtocolViolation> {
		self.state.lock().violations.clone()
	}

	fn record(&self, violation: ProtocolViolation) {
		tracing::error!(%violation, "verifier.violation");
		self.state.lock().violations.push(violation);
	}
}

impl<E: Element> CoordinatorObserver<E> for ProtocolVerifier<E> {
	fn on_sequence_begin(&self) {
		{
			let mut state = self.state.lock();
			if state.sequence_open {
				drop(state);
				self.record(ProtocolViolation::UnbalancedSequence("begin while a sequence is open".into()));
			} else {
				state.sequence_open = true;
				state.sequences_begun += 1;
			}
		}
		self.notify.notify_waiters();
	}

	fn on_sequence_complete(&self) {
		{
			let mut state = self.state.lock();
			if !state.sequence_open {
				drop(state);
				self.record(ProtocolViolation::UnbalancedSequence("complete without an open sequence".into()));
			} else {
				state.sequence_open = false;
				state.sequences_completed += 1;
			}
		}
		self.notify.notify_waiters();
	}

	fn on_request_started(&self, request: &RequestDescriptor<E>) {
		let duplicate = {
			let mut state = self.state.lock();
			let duplicate = state
				.outstanding
				.values()
				.any(|(path, kind)| *path == request.path && *kind == request.kind);
			state.outstanding.insert(request.id, (request.path.clone(), request.kind.clone()));
			*state.started.entry((request.path.clone(), request.kind.class())).or_insert(0) += 1;
			duplicate
		};
		if duplicate {
			self.record(ProtocolViolation::RedundantRequest(format!("{:?} for {:?}", request.kind, request.path)));
		}
		self.notify.notify_waiters();
	}

	fn on_request_complete(&self, request: &RequestDescriptor<E>, canceled: bool) {
		let out_of_order = {
			let mut state = self.state.lock();
			state.outstanding.remove(&request.id);
			if canceled {
				state.canceled += 1;
			} else {
				state.completed += 1;
			}
			// A completion is applied only after every lower-priority request
			// for the same path has completed.
			!canceled
				&& state
					.outstanding
					.values()
					.any(|(path, kind)| *path == request.path && kind.class() < request.kind.class())
		};
		if out_of_order {
			self.record(ProtocolViolation::OutOfOrderCompletion(format!(
				"{:?} for {:?} applied before a lower-priority request finished",
				request.kind, request.path
			)));
		}
		self.notify.notify_waiters();
	}

	fn on_model_changed(&self, _delta: &Delta<E>) {
		self.state.lock().model_changes += 1;
		self.notify.notify_waiters();
	}

	fn on_state_saved(&self, _token: &StateToken) {
		self.state.lock().state_saves += 1;
		self.notify.notify_waiters();
	}

	fn on_state_restored(&self, _token: &StateToken) {
		self.state.lock().state_restores += 1;
		self.notify.notify_waiters();
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn descriptor(id: u64, segments: &[&'static str], kind: UpdateKind) -> RequestDescriptor<&'static str> {
		RequestDescriptor {
			id,
			path: TreePath::from_segments(segments.to_vec()),
			kind,
			coalesced: 1,
		}
	}

	#[test]
	fn balanced_sequences_pass() {
		let verifier: ProtocolVerifier<&'static str> = ProtocolVerifier::new();
		verifier.on_sequence_begin();
		verifier.on_sequence_complete();
		assert_eq!(verifier.sequences(), (1, 1));
		assert!(verifier.violations().is_empty());
	}

	#[test]
	fn double_begin_is_a_violation() {
		let verifier: ProtocolVerifier<&'static str> = ProtocolVerifier::new();
		verifier.on_sequence_begin();
		verifier.on_sequence_begin();
		assert!(matches!(verifier.violations().as_slice(), [ProtocolViolation::UnbalancedSequence(_)]));
	}

	#[test]
	fn duplicate_live_identity_is_a_violation() {
		let verifier: ProtocolVerifier<&'static str> = ProtocolVerifier::new();
		verifier.on_request_started(&descriptor(1, &["a"], UpdateKind::ChildCount));
		verifier.on_request_started(&descriptor(2, &["a"], UpdateKind::ChildCount));
		assert!(matches!(verifier.violations().as_slice(), [ProtocolViolation::RedundantRequest(_)]));
	}

	#[test]
	fn completion_before_lower_priority_request_is_a_violation() {
		let verifier: ProtocolVerifier<&'static str> = ProtocolVerifier::new();
		verifier.on_request_started(&descriptor(1, &["a"], UpdateKind::ChildCount));
		verifier.on_request_started(&descriptor(2, &["a"], UpdateKind::Children { offset: 0, length: 3 }));
		verifier.on_request_complete(&descriptor(2, &["a"], UpdateKind::Children { offset: 0, length: 3 }), false);
		assert!(matches!(verifier.violations().as_slice(), [ProtocolViolation::OutOfOrderCompletion(_)]));
	}

	#[tokio::test]
	async fn wait_settled_blocks_on_armed_expectations() {
		let verifier: ProtocolVerifier<&'static str> = ProtocolVerifier::new();
		verifier.expect_sequences(1);
		let err = verifier.wait_settled(Duration::from_millis(20)).await.unwrap_err();
		assert!(matches!(err, ProtocolViolation::Timeout(..)));

		verifier.on_sequence_begin();
		verifier.on_sequence_complete();
		verifier.wait_settled(Duration::from_millis(20)).await.unwrap();
	}
}

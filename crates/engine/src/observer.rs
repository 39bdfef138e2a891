use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use canopy_delta::{Delta, Element};

use crate::request::RequestDescriptor;
use crate::source::StateToken;

/// Passive observer of coordinator protocol events.
///
/// All callbacks run on the coordination task; they must be quick and must not
/// call back into the coordinator synchronously. Default implementations
/// ignore everything, so observers override only what they track.
pub trait CoordinatorObserver<E: Element>: Send + Sync {
	/// Outstanding requests went 0 → 1; fired exactly once per sequence.
	fn on_sequence_begin(&self) {}

	/// Outstanding requests went 1 → 0; fired exactly once per sequence.
	fn on_sequence_complete(&self) {}

	/// A new (non-coalesced) request entered the pending table.
	fn on_request_started(&self, request: &RequestDescriptor<E>) {
		let _ = request;
	}

	/// A request left the pending table; `canceled` marks cancellations.
	fn on_request_complete(&self, request: &RequestDescriptor<E>, canceled: bool) {
		let _ = (request, canceled);
	}

	/// A delta was delivered to the coordinator.
	fn on_model_changed(&self, delta: &Delta<E>) {
		let _ = delta;
	}

	/// An expand/select memento was captured for the input encoded as `token`.
	fn on_state_saved(&self, token: &StateToken) {
		let _ = token;
	}

	/// A memento replay for the input encoded as `token` started.
	fn on_state_restore_started(&self, token: &StateToken) {
		let _ = token;
	}

	/// The memento replay for `token` resolved its last node.
	fn on_state_restored(&self, token: &StateToken) {
		let _ = token;
	}
}

/// Plain observer list with a recover-and-log dispatch boundary.
///
/// One observer panicking must not break dispatch to the others, so every
/// callback runs inside `catch_unwind`.
pub(crate) struct ObserverList<E: Element> {
	observers: Vec<Arc<dyn CoordinatorObserver<E>>>,
}

impl<E: Element> ObserverList<E> {
	pub fn new() -> Self {
		Self { observers: Vec::new() }
	}

	pub fn add(&mut self, observer: Arc<dyn CoordinatorObserver<E>>) {
		self.observers.push(observer);
	}

	/// Invokes `event` on every observer, isolating panics.
	pub fn notify(&self, event: impl Fn(&dyn CoordinatorObserver<E>)) {
		for observer in &self.observers {
			if catch_unwind(AssertUnwindSafe(|| event(observer.as_ref()))).is_err() {
				tracing::error!("coordinator.observer.panicked");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct Panicking;
	impl CoordinatorObserver<&'static str> for Panicking {
		fn on_sequence_begin(&self) {
			panic!("observer bug");
		}
	}

	#[derive(Default)]
	struct Counting {
		begins: AtomicUsize,
	}
	impl CoordinatorObserver<&'static str> for Counting {
		fn on_sequence_begin(&self) {
			self.begins.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn a_panicking_observer_does_not_break_dispatch() {
		let mut list: ObserverList<&'static str> = ObserverList::new();
		let counting = Arc::new(Counting::default());
		list.add(Arc::new(Panicking));
		list.add(counting.clone());
		list.notify(|observer| observer.on_sequence_begin());
		assert_eq!(counting.begins.load(Ordering::SeqCst), 1);
	}
}

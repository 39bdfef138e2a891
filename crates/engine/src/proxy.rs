use canopy_delta::{Delta, Element};
use tokio::sync::mpsc;

use crate::coordinator::Msg;

/// Handle a model proxy uses to feed deltas back into the coordinator.
///
/// Sends hand off through the coordination ingress queue; a proxy never touches
/// coordinator state directly. Sending after the coordinator shut down is a
/// silent no-op.
pub struct DeltaSender<E: Element> {
	tx: mpsc::UnboundedSender<Msg<E>>,
}

impl<E: Element> DeltaSender<E> {
	pub(crate) fn new(tx: mpsc::UnboundedSender<Msg<E>>) -> Self {
		Self { tx }
	}

	/// Delivers a model change to the coordinator.
	pub fn send(&self, delta: Delta<E>) {
		if self.tx.send(Msg::ApplyDelta(delta)).is_err() {
			tracing::trace!("proxy.delta.dropped_after_shutdown");
		}
	}
}

impl<E: Element> Clone for DeltaSender<E> {
	fn clone(&self) -> Self {
		Self { tx: self.tx.clone() }
	}
}

/// Model-side change watcher for one subtree.
///
/// Installed by an INSTALL delta node and disposed by UNINSTALL: a subtree is
/// only watched for further changes while it is visible/installed (lazy
/// subscription).
pub trait ModelProxy<E: Element>: Send {
	/// Called once when the proxy is installed; `sender` stays valid until
	/// [`Self::disposed`].
	fn installed(&mut self, sender: DeltaSender<E>);

	/// Called once when the proxy is uninstalled or the coordinator shuts down.
	fn disposed(&mut self);
}

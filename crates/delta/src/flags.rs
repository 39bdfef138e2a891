use core::fmt;

use bitflags::bitflags;

bitflags! {
	/// Per-node change kinds carried by a [`Delta`](crate::Delta) node.
	///
	/// Flags are bitflags so a single node can describe several kinds of change
	/// at once (a refreshed node that should also end up expanded, say). The
	/// coordination actor applies the flags of one node in a fixed order, so the
	/// combination is unambiguous.
	#[derive(Default, Clone, Copy, Eq, PartialEq, Hash)]
	pub struct DeltaFlags: u32 {
		/// Element was added under its parent.
		const ADDED     = 0b00_0000_0001;
		/// Element was removed from its parent.
		const REMOVED   = 0b00_0000_0010;
		/// Element's content (children) changed and must be re-queried.
		const CONTENT   = 0b00_0000_0100;
		/// Element should be expanded in the viewer.
		const EXPAND    = 0b00_0000_1000;
		/// Element should be part of the viewer selection.
		const SELECT    = 0b00_0001_0000;
		/// Element's presentation (label, style) changed; no structural change.
		const STATE     = 0b00_0010_0000;
		/// Element was inserted at a specific slot, preserving sibling indices.
		const INSERTED  = 0b00_0100_0000;
		/// Element replaces whatever previously occupied its slot.
		const REPLACED  = 0b00_1000_0000;
		/// A model proxy should be installed for the element.
		const INSTALL   = 0b01_0000_0000;
		/// The element's model proxy should be disposed.
		const UNINSTALL = 0b10_0000_0000;
	}
}

impl DeltaFlags {
	/// No change. The empty set, so it can never combine with other flags.
	pub const NO_CHANGE: DeltaFlags = DeltaFlags::empty();
}

impl fmt::Debug for DeltaFlags {
	/// Formats the empty set as `NO_CHANGE` instead of `DeltaFlags(0x0)`.
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		if self.is_empty() {
			return write!(f, "NO_CHANGE");
		}
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_change_is_empty() {
		assert!(DeltaFlags::NO_CHANGE.is_empty());
		assert_eq!(format!("{:?}", DeltaFlags::NO_CHANGE), "NO_CHANGE");
	}

	#[test]
	fn flags_compose() {
		let flags = DeltaFlags::CONTENT | DeltaFlags::EXPAND;
		assert!(flags.contains(DeltaFlags::CONTENT));
		assert!(flags.contains(DeltaFlags::EXPAND));
		assert!(!flags.contains(DeltaFlags::REMOVED));
	}
}

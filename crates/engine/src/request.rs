use canopy_delta::{Element, TreePath};

/// One kind of asynchronous query against the content source.
///
/// Range and column parameters are part of the kind: two `Children` requests
/// with different ranges are different updates and never coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdateKind {
	/// Does the element have children at all (expander hint).
	HasChildren,
	/// How many children the element has.
	ChildCount,
	/// The children in `[offset, offset + length)`.
	Children {
		/// First child index requested.
		offset: usize,
		/// Number of children requested.
		length: usize,
	},
	/// The element's label for one column (`None` = the single unnamed column).
	Label {
		/// Column identifier, when the view has columns.
		column: Option<String>,
	},
}

/// Parameter-free classification of an [`UpdateKind`].
///
/// Dispatch priority follows declaration order: a node is known to be a
/// container before its count is known, before its children are fetched,
/// before its labels are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KindClass {
	/// Container query.
	HasChildren,
	/// Child count query.
	ChildCount,
	/// Child range query.
	Children,
	/// Label query.
	Label,
}

impl UpdateKind {
	/// The request's parameter-free class.
	pub fn class(&self) -> KindClass {
		match self {
			Self::HasChildren => KindClass::HasChildren,
			Self::ChildCount => KindClass::ChildCount,
			Self::Children { .. } => KindClass::Children,
			Self::Label { .. } => KindClass::Label,
		}
	}

	/// Dispatch priority; lower dispatches first.
	pub fn priority(&self) -> u8 {
		self.class() as u8
	}
}

/// Dedup identity of an update request.
///
/// Two requests are *the same update* iff their keys are equal; object identity
/// plays no role. Equal pending requests coalesce into one dispatched query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey<E> {
	/// Element path the query addresses.
	pub path: TreePath<E>,
	/// Query kind, including range/column parameters.
	pub kind: UpdateKind,
}

impl<E: Element> RequestKey<E> {
	/// Builds a key for `kind` against `path`.
	pub fn new(path: TreePath<E>, kind: UpdateKind) -> Self {
		Self { path, kind }
	}

	/// The scheduling key: the parent path, under which sibling requests batch.
	pub fn scheduling_key(&self) -> TreePath<E> {
		self.path.parent().unwrap_or_else(TreePath::root)
	}
}

/// Lifecycle of one update request.
///
/// `Scheduled → Running → Complete | Canceled`; `Canceled` is terminal and a
/// canceled request never mutates the viewer surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
	/// Queued, not yet handed to a worker.
	Scheduled,
	/// Dispatched to a worker, completion pending.
	Running,
	/// Canceled; any late completion is discarded.
	Canceled,
	/// Completed and applied.
	Complete,
}

/// Observer-facing description of one update request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor<E> {
	/// Coordinator-unique request id.
	pub id: u64,
	/// Element path the query addresses.
	pub path: TreePath<E>,
	/// Query kind, including parameters.
	pub kind: UpdateKind,
	/// How many duplicate schedules coalesced into this request.
	pub coalesced: u32,
}

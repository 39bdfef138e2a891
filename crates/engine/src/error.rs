use thiserror::Error;

/// Failures reported by a [`ContentSource`](crate::ContentSource) query.
///
/// A failed query is not fatal to the coordinator: the completion carries the
/// error status and the coordinator degrades the affected node (a failed child
/// count leaves the count unknown and marks the node non-expandable). Stale
/// completions are not errors at all; they are discarded silently.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentSourceError {
	/// The backing model could not answer the query.
	#[error("content query failed: {0}")]
	Query(String),

	/// The addressed element no longer exists in the model.
	#[error("element is gone from the model")]
	Gone,

	/// The element does not participate in state save/restore.
	#[error("element has no state encoding")]
	NotEncodable,
}

impl ContentSourceError {
	/// Convenience constructor for a failed query.
	pub fn query(message: impl Into<String>) -> Self {
		Self::Query(message.into())
	}
}

/// Result type for content source queries.
pub type SourceResult<T> = Result<T, ContentSourceError>;

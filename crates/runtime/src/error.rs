//! Error types for the broker runtime.

use thiserror::Error;
use ucm_protocol::ContextId;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the broker.
#[derive(Debug, Error)]
pub enum Error {
	/// No object with this id exists.
	#[error("{kind} {id} not found")]
	NotFound { kind: &'static str, id: u64 },

	/// The object exists but belongs to another session.
	#[error("{kind} {id} is owned by another session")]
	PermissionDenied { kind: &'static str, id: u64 },

	/// The context is being torn down and accepts no new operations.
	#[error("{0} is closing")]
	Unavailable(ContextId),

	/// Id space full, allocation failure or backlog budget exceeded.
	#[error("Resource exhausted: {0}")]
	ResourceExhausted(String),

	/// Malformed request fields.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Output buffer too small for the response.
	#[error("Output buffer too small: need {needed} bytes, have {available}")]
	InsufficientSpace { needed: usize, available: usize },

	/// Unknown opcode or option.
	#[error("Unsupported: {0}")]
	Unsupported(String),

	/// Non-blocking dequeue on an empty queue.
	#[error("No event pending")]
	WouldBlock,

	/// Failure reported by the connection manager.
	#[error("Connection manager error: {0}")]
	Manager(String),

	/// The session has been closed.
	#[error("Session closed")]
	SessionClosed,

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	pub(crate) fn context_not_found(id: ContextId) -> Self {
		Error::NotFound {
			kind: "context",
			id: id.0 as u64,
		}
	}

	pub(crate) fn context_denied(id: ContextId) -> Self {
		Error::PermissionDenied {
			kind: "context",
			id: id.0 as u64,
		}
	}

	/// Stable errno-style name used in daemon responses.
	pub fn code(&self) -> &'static str {
		match self {
			Error::NotFound { .. } => "ENOENT",
			Error::PermissionDenied { .. } => "EINVAL",
			Error::Unavailable(_) => "EIO",
			Error::ResourceExhausted(_) => "ENOMEM",
			Error::InvalidArgument(_) | Error::Json(_) => "EINVAL",
			Error::InsufficientSpace { .. } => "ENOSPC",
			Error::Unsupported(_) => "ENOSYS",
			Error::WouldBlock => "EAGAIN",
			Error::Manager(_) | Error::Io(_) => "EIO",
			Error::SessionClosed => "EBADF",
		}
	}

	/// Returns true if the requested object does not exist.
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound { .. })
	}

	/// Returns true if the context is mid-teardown.
	pub fn is_unavailable(&self) -> bool {
		matches!(self, Error::Unavailable(_))
	}

	/// Returns true if a non-blocking dequeue found nothing.
	pub fn is_would_block(&self) -> bool {
		matches!(self, Error::WouldBlock)
	}
}

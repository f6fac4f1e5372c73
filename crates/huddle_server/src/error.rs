#![forbid(unsafe_code)]

use thiserror::Error;

/// Verification failures of the token authority.
///
/// Callers only ever see these two outcomes: an expired token can be refreshed
/// silently, an invalid one requires authenticating from scratch.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
	#[error("invalid token")]
	Invalid,

	#[error("token has expired")]
	Expired,
}

/// Durable store failures.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{0} not found")]
	NotFound(&'static str),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("store backend error: {0:#}")]
	Backend(#[from] anyhow::Error),
}

/// Cache backend failures. Never escapes the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
	#[error("cache backend error: {0}")]
	Backend(String),
}

/// Errors surfaced to realtime clients and privileged callers.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("invalid token")]
	InvalidToken,

	#[error("token has expired")]
	ExpiredToken,

	#[error("not a member of this room")]
	NotAMember,

	#[error("insufficient role")]
	InsufficientRole,

	#[error("the room creator cannot leave or be removed")]
	CreatorImmutable,

	#[error("malformed message: {0}")]
	MalformedMessage(String),

	/// The message could not be written; nothing was broadcast.
	#[error("failed to persist message: {0}")]
	Persist(#[source] StoreError),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("internal error: {0:#}")]
	Internal(#[from] anyhow::Error),
}

impl ChatError {
	/// Whether the realtime connection must be closed after reporting this error.
	///
	/// Store failures are reported to the sender only; everything else ends the
	/// connection attempt.
	pub fn is_terminal(&self) -> bool {
		!matches!(self, ChatError::Store(_) | ChatError::Persist(_))
	}

	/// Text written into `{"error": ...}` frames.
	pub fn client_message(&self) -> String {
		match self {
			ChatError::Persist(_) => "failed to persist message".to_string(),
			ChatError::Store(StoreError::Backend(_)) => "store unavailable".to_string(),
			ChatError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		}
	}
}

impl From<TokenError> for ChatError {
	fn from(err: TokenError) -> Self {
		match err {
			TokenError::Invalid => ChatError::InvalidToken,
			TokenError::Expired => ChatError::ExpiredToken,
		}
	}
}

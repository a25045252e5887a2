//! The error taxonomy shared by every component of the runtime.
//!
//! Every fallible operation in this crate returns [`Result`]; there is no
//! thread-local "last error" slot the way the C original used one. `?`
//! propagates, exactly like anywhere else in idiomatic Rust.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy. Each variant corresponds to one row of the error
/// table in the specification; `Memory` has no counterpart here because
/// Rust's global allocator aborts on exhaustion instead of returning a
/// `Result`.
#[derive(Debug, Error)]
pub enum Error {
	/// An underlying syscall failed.
	#[error("os error: {0}")]
	Os(#[from] std::io::Error),

	/// The operation was cancelled, either by an explicit `cancel` or by
	/// channel/lock finalization.
	#[error("operation cancelled")]
	Cancelled,

	/// A precondition was violated, e.g. releasing a lock that isn't held.
	#[error("assertion failed: {0}")]
	Assert(String),

	/// A frame was malformed or exceeded the negotiated size limit.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// An RPC request named a method that isn't exported.
	#[error("method not exported: {0}")]
	NotExported(String),

	/// A local handler produced output larger than a single frame can hold.
	#[error("encoded output exceeds the maximum frame size")]
	Overflow,

	/// A codec signature string was malformed.
	#[error("invalid signature: {0}")]
	SignSyntax(String),

	/// Codec input ended before the signature was fully decoded.
	#[error("truncated input")]
	Truncated,

	/// An error that originated on the far side of an RPC call.
	#[error("remote error {code} ({name}): {text}")]
	Remote {
		code: u32,
		name: String,
		text: String
	},

	/// A selector registration collided with one already present.
	#[error("duplicate registration")]
	Duplicate,

	/// A cancel referenced a timer or subscription that no longer exists.
	#[error("not found")]
	NotFound
}

impl Error {
	pub(crate) fn assert(msg: impl Into<String>) -> Self {
		Self::Assert(msg.into())
	}

	pub(crate) fn protocol(msg: impl Into<String>) -> Self {
		Self::Protocol(msg.into())
	}

	pub(crate) fn sign_syntax(msg: impl Into<String>) -> Self {
		Self::SignSyntax(msg.into())
	}

	/// A stable numeric tag identifying this error's kind across an RPC
	/// channel's `ResponseError` frame, so the calling peer can reconstruct
	/// an equivalent [`Error::Remote`]. Arbitrary beyond "stable and unique
	/// per variant" — there's no wire-level registry to match.
	pub(crate) fn wire_code(&self) -> u32 {
		match self {
			Self::Os(_) => 1,
			Self::Cancelled => 2,
			Self::Assert(_) => 3,
			Self::Protocol(_) => 4,
			Self::NotExported(_) => 5,
			Self::Overflow => 6,
			Self::SignSyntax(_) => 7,
			Self::Truncated => 8,
			Self::Remote { code, .. } => *code,
			Self::Duplicate => 9,
			Self::NotFound => 10
		}
	}

	/// The short name paired with [`Error::wire_code`] on the wire.
	pub(crate) fn wire_name(&self) -> &str {
		match self {
			Self::Os(_) => "OS",
			Self::Cancelled => "CANCELLED",
			Self::Assert(_) => "ASSERT",
			Self::Protocol(_) => "PROTOCOL",
			Self::NotExported(_) => "NOT_EXPORTED",
			Self::Overflow => "OVERFLOW",
			Self::SignSyntax(_) => "SIGN_SYNTAX",
			Self::Truncated => "TRUNCATED",
			Self::Remote { name, .. } => name,
			Self::Duplicate => "DUPLICATE",
			Self::NotFound => "NOT_FOUND"
		}
	}
}

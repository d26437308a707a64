//! Error types for the telco runtime.
//!
//! Two families share one enum: local precondition failures raised before
//! anything crosses the boundary (`NilHandle`, `Closed`, `InvalidArgument`),
//! and engine failures surfaced verbatim as `Engine { code, message }`.

use telco_protocol::ErrorCode;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// Operation on a nil or already released handle.
	#[error("{kind} handle is nil or released")]
	NilHandle { kind: &'static str },

	/// Operation on an object that was explicitly closed.
	#[error("{kind} is closed")]
	Closed { kind: &'static str },

	/// Invalid argument provided to method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Error reported by the engine, code and message untouched.
	#[error("{code}: {message}")]
	Engine { code: ErrorCode, message: String },

	/// Channel closed unexpectedly.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	/// Transport-level error (pipe, socket).
	#[error("Transport error: {0}")]
	Transport(String),

	/// Malformed or unexpected boundary message.
	#[error("Protocol error: {0}")]
	Protocol(String),

	/// Engine executable was not found.
	#[error("telco engine not found. Set TELCO_ENGINE_PATH or put telco-engine on PATH")]
	EngineNotFound,

	/// Failed to launch the engine process.
	#[error("Failed to launch telco engine: {0}")]
	LaunchFailed(String),

	/// Invalid configuration value.
	#[error("Configuration error: {0}")]
	Config(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	pub fn engine(code: ErrorCode, message: impl Into<String>) -> Self {
		Self::Engine {
			code,
			message: message.into(),
		}
	}

	/// Returns the engine error code, if the engine produced this error.
	pub fn code(&self) -> Option<ErrorCode> {
		match self {
			Error::Engine { code, .. } => Some(*code),
			_ => None,
		}
	}

	/// Returns true if a "get" style lookup found nothing.
	pub fn is_not_found(&self) -> bool {
		matches!(
			self.code(),
			Some(ErrorCode::NotFound | ErrorCode::ProcessNotFound)
		)
	}

	/// Returns true if a "find" style lookup waited out its timeout.
	pub fn is_timeout(&self) -> bool {
		self.code() == Some(ErrorCode::TimedOut)
	}

	/// Returns true for errors raised locally without a boundary crossing.
	pub fn is_local(&self) -> bool {
		matches!(
			self,
			Error::NilHandle { .. } | Error::Closed { .. } | Error::InvalidArgument(_)
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_found_and_timeout_are_distinct() {
		let missing = Error::engine(ErrorCode::NotFound, "device not found");
		let waited = Error::engine(ErrorCode::TimedOut, "timed out waiting for device");

		assert!(missing.is_not_found());
		assert!(!missing.is_timeout());
		assert!(waited.is_timeout());
		assert!(!waited.is_not_found());
	}

	#[test]
	fn engine_errors_render_code_and_message() {
		let err = Error::engine(ErrorCode::ProcessNotFound, "unable to find process with pid 42");
		assert_eq!(err.to_string(), "process-not-found: unable to find process with pid 42");
		assert!(err.is_not_found());
		assert!(!err.is_local());
	}

	#[test]
	fn nil_handle_is_local() {
		let err = Error::NilHandle { kind: "device" };
		assert!(err.is_local());
		assert_eq!(err.code(), None);
	}
}

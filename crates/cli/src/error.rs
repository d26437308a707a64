use thiserror::Error;

use crate::output::{CommandError, ErrorCode};

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("invalid input: {0}")]
	Input(String),

	#[error(transparent)]
	Telco(#[from] telco::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

/// Maps a client error onto the envelope's codes.
fn classify(err: &telco::Error) -> ErrorCode {
	use telco::ErrorCode as Engine;

	match err {
		telco::Error::EngineNotFound | telco::Error::LaunchFailed(_) => ErrorCode::EngineUnavailable,
		telco::Error::ChannelClosed | telco::Error::Transport(_) => ErrorCode::ConnectionLost,
		telco::Error::Config(_) => ErrorCode::ConfigError,
		telco::Error::Io(_) => ErrorCode::IoError,
		telco::Error::InvalidArgument(_) => ErrorCode::InvalidInput,
		err if err.is_timeout() => ErrorCode::Timeout,
		telco::Error::Engine { code, .. } => match code {
			Engine::ProcessNotFound | Engine::ExecutableNotFound => ErrorCode::ProcessNotFound,
			Engine::NotFound => ErrorCode::DeviceNotFound,
			Engine::InvalidArgument => ErrorCode::InvalidInput,
			Engine::PermissionDenied => ErrorCode::PermissionDenied,
			Engine::ServerNotRunning | Engine::Transport => ErrorCode::ConnectionLost,
			_ => ErrorCode::EngineError,
		},
		_ => ErrorCode::InternalError,
	}
}

impl CliError {
	pub fn to_command_error(&self) -> CommandError {
		let (code, details) = match self {
			CliError::Input(_) => (ErrorCode::InvalidInput, None),
			CliError::Telco(err) => (
				classify(err),
				err.code().map(|code| serde_json::json!({ "engineCode": code.to_string() })),
			),
			CliError::Io(_) => (ErrorCode::IoError, None),
			CliError::Json(_) | CliError::Anyhow(_) => (ErrorCode::InternalError, None),
		};

		CommandError {
			code,
			message: self.to_string(),
			details,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn engine_codes_map_to_envelope_codes() {
		let err = CliError::from(telco::Error::engine(telco::ErrorCode::ProcessNotFound, "no pid 9"));
		let cmd = err.to_command_error();
		assert_eq!(cmd.code, ErrorCode::ProcessNotFound);
		assert_eq!(cmd.details.unwrap()["engineCode"], "process-not-found");

		let err = CliError::from(telco::Error::engine(telco::ErrorCode::TimedOut, "gave up"));
		assert_eq!(err.to_command_error().code, ErrorCode::Timeout);

		let err = CliError::from(telco::Error::engine(telco::ErrorCode::AddressInUse, "busy"));
		assert_eq!(err.to_command_error().code, ErrorCode::EngineError);
	}

	#[test]
	fn local_failures() {
		let err = CliError::from(telco::Error::ChannelClosed);
		assert_eq!(err.to_command_error().code, ErrorCode::ConnectionLost);
		assert!(err.to_command_error().details.is_none());

		let err = CliError::Input("bad env entry \"FOO\"".into());
		let cmd = err.to_command_error();
		assert_eq!(cmd.code, ErrorCode::InvalidInput);
		assert!(cmd.message.contains("FOO"));
	}
}

//! Engine executable discovery and process lifecycle.
//!
//! The engine is searched for in this order:
//! 1. `Config::engine_path`
//! 2. `TELCO_ENGINE_PATH`
//! 3. `<user data dir>/telco/bin/telco-engine`
//! 4. `telco-engine` on `PATH`
//!
//! A launched engine speaks the boundary protocol on its stdio pipes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{Config, ENV_ENGINE_PATH};
use crate::error::{Error, Result};
use crate::transport::{PipeTransport, TransportParts};

pub const ENGINE_BINARY: &str = if cfg!(windows) { "telco-engine.exe" } else { "telco-engine" };

/// Locates the engine executable for `config`.
pub fn find_engine(config: &Config) -> Result<PathBuf> {
	discover(
		config.engine_path.as_deref(),
		std::env::var(ENV_ENGINE_PATH).ok().map(PathBuf::from),
		dirs::data_dir(),
		|| which::which(ENGINE_BINARY).ok(),
	)
}

fn discover(
	explicit: Option<&Path>,
	from_env: Option<PathBuf>,
	data_dir: Option<PathBuf>,
	on_path: impl FnOnce() -> Option<PathBuf>,
) -> Result<PathBuf> {
	if let Some(path) = explicit {
		if path.is_file() {
			debug!(path = %path.display(), "engine from config");
			return Ok(path.to_path_buf());
		}
		warn!(path = %path.display(), "configured engine path does not exist; falling back");
	}

	if let Some(path) = from_env.filter(|p| !p.as_os_str().is_empty()) {
		if path.is_file() {
			debug!(path = %path.display(), "engine from {ENV_ENGINE_PATH}");
			return Ok(path);
		}
		warn!(path = %path.display(), "{ENV_ENGINE_PATH} does not point at a file; falling back");
	}

	if let Some(dir) = data_dir {
		let path = dir.join("telco").join("bin").join(ENGINE_BINARY);
		if path.is_file() {
			debug!(path = %path.display(), "engine from data dir");
			return Ok(path);
		}
	}

	if let Some(path) = on_path() {
		debug!(path = %path.display(), "engine from PATH");
		return Ok(path);
	}

	Err(Error::EngineNotFound)
}

/// A running engine child process.
#[derive(Debug)]
pub struct EngineProcess {
	pub process: Child,
}

impl EngineProcess {
	/// Starts the engine with piped stdin/stdout and inherited stderr.
	pub async fn launch(config: &Config) -> Result<Self> {
		let engine = find_engine(config)?;

		let mut cmd = Command::new(&engine);
		cmd.args(&config.engine_args)
			.env("TELCO_CLIENT_NAME", "rust")
			.env("TELCO_CLIENT_VERSION", env!("CARGO_PKG_VERSION"))
			.stdin(std::process::Stdio::piped())
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::inherit())
			.kill_on_drop(true);

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::LaunchFailed(format!("{}: {e}", engine.display())))?;

		tokio::time::sleep(Duration::from_millis(100)).await;
		match child.try_wait() {
			Ok(Some(status)) => {
				return Err(Error::LaunchFailed(format!("engine exited immediately with {status}")));
			}
			Ok(None) => {}
			Err(e) => return Err(Error::LaunchFailed(format!("cannot poll engine process: {e}"))),
		}

		debug!(path = %engine.display(), pid = child.id(), "engine launched");
		Ok(Self { process: child })
	}

	/// Takes the stdio pipes and frames them as a transport. Only works once.
	pub fn take_transport(&mut self) -> Result<TransportParts> {
		let stdin = self
			.process
			.stdin
			.take()
			.ok_or_else(|| Error::LaunchFailed("engine stdin already taken".to_string()))?;
		let stdout = self
			.process
			.stdout
			.take()
			.ok_or_else(|| Error::LaunchFailed("engine stdout already taken".to_string()))?;

		let (transport, message_rx) = PipeTransport::new(stdin, stdout);
		Ok(transport.into_transport_parts(message_rx))
	}

	/// Closes the pipes and waits briefly for the engine to exit, killing it otherwise.
	pub async fn shutdown(mut self) -> Result<()> {
		drop(self.process.stdin.take());
		drop(self.process.stdout.take());

		let waited = tokio::time::timeout(Duration::from_secs(2), self.process.wait()).await;
		match waited {
			Ok(Ok(status)) => {
				debug!(%status, "engine exited");
				Ok(())
			}
			Ok(Err(e)) => Err(Error::Io(e)),
			Err(_) => self.kill().await,
		}
	}

	pub async fn kill(mut self) -> Result<()> {
		self.process
			.kill()
			.await
			.map_err(|e| Error::LaunchFailed(format!("failed to kill engine: {e}")))?;
		let _ = tokio::time::timeout(Duration::from_millis(500), self.process.wait()).await;
		Ok(())
	}
}

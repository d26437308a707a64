//! Client configuration.
//!
//! Built from defaults, then either a JSON file or `TELCO_*` environment
//! variables. Timeouts are written in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use telco_protocol::{DEFAULT_DEVICE_TIMEOUT_MS, DEFAULT_PROCESS_TIMEOUT_MS};

use crate::error::{Error, Result};

pub const ENV_ENGINE_PATH: &str = "TELCO_ENGINE_PATH";
pub const ENV_ENGINE_ARGS: &str = "TELCO_ENGINE_ARGS";
pub const ENV_DEVICE_TIMEOUT: &str = "TELCO_DEVICE_TIMEOUT_MS";
pub const ENV_PROCESS_TIMEOUT: &str = "TELCO_PROCESS_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
	/// Engine executable; discovered when unset.
	pub engine_path: Option<PathBuf>,
	/// Extra arguments passed to the engine on launch.
	pub engine_args: Vec<String>,
	/// Wait used by `find_device_*` lookups.
	#[serde(rename = "device_timeout_ms", with = "duration_ms")]
	pub device_timeout: Duration,
	/// Wait used by `find_process_*` lookups.
	#[serde(rename = "process_timeout_ms", with = "duration_ms")]
	pub process_timeout: Duration,
	/// Backlog at which a slow signal consumer gets a warning; `0` disables.
	pub signal_queue_warn: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			engine_path: None,
			engine_args: Vec::new(),
			device_timeout: Duration::from_millis(u64::from(DEFAULT_DEVICE_TIMEOUT_MS)),
			process_timeout: Duration::from_millis(u64::from(DEFAULT_PROCESS_TIMEOUT_MS)),
			signal_queue_warn: 1024,
		}
	}
}

impl Config {
	/// Defaults overridden by whatever `TELCO_*` variables are set.
	pub fn from_env() -> Result<Self> {
		Self::default().with_overrides(|key| std::env::var(key).ok())
	}

	/// Reads a JSON config file; missing keys keep their defaults.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path)
			.map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
		serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
	}

	pub fn engine_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.engine_path = Some(path.into());
		self
	}

	pub fn device_timeout(mut self, timeout: Duration) -> Self {
		self.device_timeout = timeout;
		self
	}

	pub fn process_timeout(mut self, timeout: Duration) -> Self {
		self.process_timeout = timeout;
		self
	}

	/// Process lookup timeout as the engine expects it.
	pub fn process_timeout_ms(&self) -> u32 {
		u32::try_from(self.process_timeout.as_millis()).unwrap_or(u32::MAX)
	}

	fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
		if let Some(path) = lookup(ENV_ENGINE_PATH).filter(|p| !p.is_empty()) {
			self.engine_path = Some(PathBuf::from(path));
		}
		if let Some(args) = lookup(ENV_ENGINE_ARGS) {
			self.engine_args = args.split_whitespace().map(str::to_string).collect();
		}
		if let Some(ms) = lookup(ENV_DEVICE_TIMEOUT) {
			self.device_timeout = parse_ms(ENV_DEVICE_TIMEOUT, &ms)?;
		}
		if let Some(ms) = lookup(ENV_PROCESS_TIMEOUT) {
			self.process_timeout = parse_ms(ENV_PROCESS_TIMEOUT, &ms)?;
		}
		Ok(self)
	}
}

fn parse_ms(key: &str, value: &str) -> Result<Duration> {
	value
		.trim()
		.parse::<u64>()
		.map(Duration::from_millis)
		.map_err(|_| Error::Config(format!("{key} must be a whole number of milliseconds, got {value:?}")))
}

mod duration_ms {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

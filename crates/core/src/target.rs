//! Process targets for attach and injection.

use serde_json::Value;
use telco_runtime::Error;

/// A process identified by name or pid.
///
/// Names are resolved to a pid on the device with
/// [`Scope::Minimal`](telco_protocol::Scope::Minimal) before the operation
/// runs; a name with no matching process fails the whole operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
	Name(String),
	Pid(u32),
}

impl From<&str> for Target {
	fn from(name: &str) -> Self {
		Self::Name(name.to_string())
	}
}

impl From<String> for Target {
	fn from(name: String) -> Self {
		Self::Name(name)
	}
}

impl From<&String> for Target {
	fn from(name: &String) -> Self {
		Self::Name(name.clone())
	}
}

impl From<u32> for Target {
	fn from(pid: u32) -> Self {
		Self::Pid(pid)
	}
}

/// Accepts a JSON string or non-negative integer, for targets read from
/// config files or command lines.
impl TryFrom<&Value> for Target {
	type Error = Error;

	fn try_from(value: &Value) -> Result<Self, Self::Error> {
		match value {
			Value::String(name) => Ok(Self::Name(name.clone())),
			Value::Number(n) => n
				.as_u64()
				.and_then(|pid| u32::try_from(pid).ok())
				.map(Self::Pid)
				.ok_or_else(|| Error::InvalidArgument(format!("expected a process name or pid, got {n}"))),
			other => Err(Error::InvalidArgument(format!("expected a process name or pid, got {other}"))),
		}
	}
}

impl std::fmt::Display for Target {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Name(name) => f.write_str(name),
			Self::Pid(pid) => write!(f, "pid {pid}"),
		}
	}
}

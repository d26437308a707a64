//! Core enums used across the boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of execution environment a device represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
	/// The machine the engine runs on
	Local,
	/// A network-reachable engine
	Remote,
	/// A USB-attached unit
	Usb,
}

impl fmt::Display for DeviceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Local => write!(f, "local"),
			Self::Remote => write!(f, "remote"),
			Self::Usb => write!(f, "usb"),
		}
	}
}

/// Physical or logical bus a device is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
	/// In-process, no transport involved
	#[default]
	Local,
	/// USB multiplexer
	Usb,
	/// TCP/IP
	Network,
	/// Anything the engine reports that this crate does not know about
	#[serde(other)]
	Other,
}

/// Requested level of per-entity detail for queries.
///
/// Higher scopes make the engine collect more (icons, paths, users) and cost more time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
	/// Identity only
	#[default]
	Minimal,
	/// Identity plus cheap metadata
	Metadata,
	/// Everything including icons
	Full,
}

/// Execution context a session is attached in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
	#[default]
	Native,
	Emulated,
}

/// Script runtime selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptRuntime {
	#[default]
	Default,
	Qjs,
	V8,
}

/// How a snapshot is handed to the script runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotTransport {
	#[default]
	Inline,
	SharedMemory,
}

/// Standard stream handling for spawned processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stdio {
	/// Child shares the engine's stdio
	#[default]
	Inherit,
	/// Child output is delivered through the device `output` signal
	Pipe,
}

/// How a child process came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildOrigin {
	Fork,
	Exec,
	Spawn,
}

/// Transport used by a TURN relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayKind {
	#[default]
	TurnUdp,
	TurnTcp,
	TurnTls,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionDetachReason {
	ApplicationRequested,
	ProcessReplaced,
	ProcessTerminated,
	ConnectionTerminated,
	DeviceLost,
}

/// Error codes the engine reports alongside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
	ServerNotRunning,
	ExecutableNotFound,
	ExecutableNotSupported,
	ProcessNotFound,
	ProcessNotResponding,
	InvalidArgument,
	InvalidOperation,
	PermissionDenied,
	AddressInUse,
	TimedOut,
	NotSupported,
	NotFound,
	Protocol,
	Transport,
	#[serde(other)]
	Unknown,
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::ServerNotRunning => "server-not-running",
			Self::ExecutableNotFound => "executable-not-found",
			Self::ExecutableNotSupported => "executable-not-supported",
			Self::ProcessNotFound => "process-not-found",
			Self::ProcessNotResponding => "process-not-responding",
			Self::InvalidArgument => "invalid-argument",
			Self::InvalidOperation => "invalid-operation",
			Self::PermissionDenied => "permission-denied",
			Self::AddressInUse => "address-in-use",
			Self::TimedOut => "timed-out",
			Self::NotSupported => "not-supported",
			Self::NotFound => "not-found",
			Self::Protocol => "protocol",
			Self::Transport => "transport",
			Self::Unknown => "unknown",
		};
		f.write_str(s)
	}
}

//! Option objects for engine operations.
//!
//! Each option type is an independently constructed, mutable configuration
//! value. Setters chain; fields stay public so a caller can read back what it
//! configured. Operations that consume an option take it by value, so a
//! consumed option cannot be reused or released twice.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buffer::base64_bytes_opt;
use crate::types::{Realm, RelayKind, Scope, ScriptRuntime, SnapshotTransport, Stdio};

/// Default device lookup timeout in milliseconds.
pub const DEFAULT_DEVICE_TIMEOUT_MS: u32 = 10_000;

/// Default process lookup timeout in milliseconds.
pub const DEFAULT_PROCESS_TIMEOUT_MS: u32 = 5_000;

/// Session configuration for `attach`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
	pub realm: Realm,
	/// Seconds the session survives a lost connection; `0` disables persistence.
	pub persist_timeout: u32,
}

impl SessionOptions {
	pub fn new(realm: Realm, persist_timeout: u32) -> Self {
		Self {
			realm,
			persist_timeout,
		}
	}

	pub fn realm(mut self, realm: Realm) -> Self {
		self.realm = realm;
		self
	}

	pub fn persist_timeout(mut self, seconds: u32) -> Self {
		self.persist_timeout = seconds;
		self
	}
}

/// Process creation options for `spawn`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub argv: Option<Vec<String>>,
	/// Full environment, replacing the engine's.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub envp: Option<Vec<String>>,
	/// Additions layered over the engine's environment.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub env: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cwd: Option<String>,
	pub stdio: Stdio,
	#[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
	pub aux: BTreeMap<String, serde_json::Value>,
}

impl SpawnOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn argv<I, S>(mut self, argv: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.argv = Some(argv.into_iter().map(Into::into).collect());
		self
	}

	pub fn envp<I, S>(mut self, envp: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.envp = Some(envp.into_iter().map(Into::into).collect());
		self
	}

	pub fn env<I, S>(mut self, env: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.env = Some(env.into_iter().map(Into::into).collect());
		self
	}

	pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
		self.cwd = Some(cwd.into());
		self
	}

	pub fn stdio(mut self, stdio: Stdio) -> Self {
		self.stdio = stdio;
		self
	}

	/// Sets a platform-specific auxiliary option.
	pub fn aux(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
		self.aux.insert(key.into(), value);
		self
	}
}

/// Script creation options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
	pub snapshot: Option<Vec<u8>>,
	pub snapshot_transport: SnapshotTransport,
	pub runtime: ScriptRuntime,
}

impl ScriptOptions {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: Some(name.into()),
			..Self::default()
		}
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	/// Copies `snapshot` into the options; the caller's buffer is free to go afterwards.
	pub fn snapshot(mut self, snapshot: &[u8]) -> Self {
		self.snapshot = Some(snapshot.to_vec());
		self
	}

	pub fn snapshot_transport(mut self, transport: SnapshotTransport) -> Self {
		self.snapshot_transport = transport;
		self
	}

	pub fn runtime(mut self, runtime: ScriptRuntime) -> Self {
		self.runtime = runtime;
		self
	}
}

/// Options for producing a runtime snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub warmup_script: Option<String>,
	pub runtime: ScriptRuntime,
}

impl SnapshotOptions {
	pub fn new(warmup_script: impl Into<String>, runtime: ScriptRuntime) -> Self {
		Self {
			warmup_script: Some(warmup_script.into()),
			runtime,
		}
	}

	pub fn warmup_script(mut self, script: impl Into<String>) -> Self {
		self.warmup_script = Some(script.into());
		self
	}

	pub fn runtime(mut self, runtime: ScriptRuntime) -> Self {
		self.runtime = runtime;
		self
	}
}

/// TURN relay used for peer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
	pub address: String,
	pub username: String,
	pub password: String,
	pub kind: RelayKind,
}

impl Relay {
	pub fn new(
		address: impl Into<String>,
		username: impl Into<String>,
		password: impl Into<String>,
		kind: RelayKind,
	) -> Self {
		Self {
			address: address.into(),
			username: username.into(),
			password: password.into(),
			kind,
		}
	}
}

/// Peer-to-peer connection setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stun_server: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub relays: Vec<Relay>,
}

impl PeerOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn stun_server(mut self, server: impl Into<String>) -> Self {
		self.stun_server = Some(server.into());
		self
	}

	pub fn add_relay(mut self, relay: Relay) -> Self {
		self.relays.push(relay);
		self
	}

	/// Removes previously added relays.
	pub fn clear_relays(mut self) -> Self {
		self.relays.clear();
		self
	}
}

/// Connection options for remote devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeviceOptions {
	/// PEM-encoded certificate, or a path to one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub certificate: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub origin: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	/// Seconds between keepalives; `None` keeps the engine default, `0` disables.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub keepalive_interval: Option<u32>,
}

impl RemoteDeviceOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn certificate(mut self, certificate: impl Into<String>) -> Self {
		self.certificate = Some(certificate.into());
		self
	}

	pub fn origin(mut self, origin: impl Into<String>) -> Self {
		self.origin = Some(origin.into());
		self
	}

	pub fn token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	pub fn keepalive_interval(mut self, seconds: u32) -> Self {
		self.keepalive_interval = Some(seconds);
		self
	}
}

/// One listening endpoint of a portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointParameters {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub address: Option<String>,
	/// `0` lets the engine pick its default port for the endpoint role.
	pub port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub certificate: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub origin: Option<String>,
	/// Static token every connecting peer must present.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	/// Directory served over HTTP on the control endpoint.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub asset_root: Option<String>,
}

impl EndpointParameters {
	pub fn new(address: impl Into<String>, port: u16) -> Self {
		Self {
			address: Some(address.into()),
			port,
			certificate: None,
			origin: None,
			token: None,
			asset_root: None,
		}
	}

	pub fn certificate(mut self, certificate: impl Into<String>) -> Self {
		self.certificate = Some(certificate.into());
		self
	}

	pub fn origin(mut self, origin: impl Into<String>) -> Self {
		self.origin = Some(origin.into());
		self
	}

	pub fn token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	pub fn asset_root(mut self, root: impl Into<String>) -> Self {
		self.asset_root = Some(root.into());
		self
	}
}

/// Options for joining a portal from an attached session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub certificate: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	/// Tags the portal applies to this node's connection.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub acl: Vec<String>,
}

impl PortalOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn certificate(mut self, certificate: impl Into<String>) -> Self {
		self.certificate = Some(certificate.into());
		self
	}

	pub fn token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	pub fn acl<I, S>(mut self, acl: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.acl = acl.into_iter().map(Into::into).collect();
		self
	}
}

/// Lookup options for get/find process calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMatchOptions {
	/// Milliseconds a find call may wait for the process to appear.
	pub timeout: u32,
	pub scope: Scope,
}

impl Default for ProcessMatchOptions {
	fn default() -> Self {
		Self {
			timeout: DEFAULT_PROCESS_TIMEOUT_MS,
			scope: Scope::Minimal,
		}
	}
}

impl ProcessMatchOptions {
	pub fn new(timeout: u32, scope: Scope) -> Self {
		Self { timeout, scope }
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessQueryOptions {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub pids: Vec<u32>,
	pub scope: Scope,
}

impl ProcessQueryOptions {
	pub fn new(scope: Scope) -> Self {
		Self {
			pids: Vec::new(),
			scope,
		}
	}

	pub fn select_pid(mut self, pid: u32) -> Self {
		self.pids.push(pid);
		self
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationQueryOptions {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub identifiers: Vec<String>,
	pub scope: Scope,
}

impl ApplicationQueryOptions {
	pub fn new(scope: Scope) -> Self {
		Self {
			identifiers: Vec::new(),
			scope,
		}
	}

	pub fn select_identifier(mut self, identifier: impl Into<String>) -> Self {
		self.identifiers.push(identifier.into());
		self
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontmostQueryOptions {
	pub scope: Scope,
}

impl FrontmostQueryOptions {
	pub fn new(scope: Scope) -> Self {
		Self { scope }
	}
}

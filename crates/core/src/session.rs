//! Live attachment to one process.

use serde::Deserialize;
use serde_json::{Value, json};
use telco_protocol::buffer::base64_bytes;
use telco_protocol::{
	HandleRef, MembershipDescriptor, PeerOptions, PortalOptions, ScriptOptions, SessionDescriptor, SnapshotOptions,
	TransferBuffer,
};
use telco_runtime::{Channel, Error, HandleKind, Result};
use tracing::debug;

use crate::context::Context;
use crate::handlers::Subscription;
use crate::membership::PortalMembership;
use crate::script::Script;
use crate::signals::{SessionSignal, SignalBridge};

const KIND: &str = "session";

#[derive(Deserialize)]
struct Bytes {
	#[serde(with = "base64_bytes")]
	bytes: Vec<u8>,
}

/// A session created by [`Device::attach`](crate::Device::attach).
///
/// Bound to one pid for its whole life. It survives the process only when
/// attached with a non-zero `persist_timeout`.
pub struct Session {
	ctx: Context,
	desc: SessionDescriptor,
	signals: SignalBridge<SessionSignal>,
	channel: Channel,
}

impl Session {
	pub(crate) fn adopt(ctx: &Context, desc: SessionDescriptor) -> Self {
		let channel = ctx.channel(desc.handle, HandleKind::Object, KIND);
		Self {
			ctx: ctx.clone(),
			signals: SignalBridge::new(ctx, &channel),
			channel,
			desc,
		}
	}

	pub fn pid(&self) -> u32 {
		self.desc.pid
	}

	/// Seconds the session outlives a lost connection; `0` means it does not.
	pub fn persist_timeout(&self) -> u32 {
		self.desc.persist_timeout
	}

	pub async fn is_detached(&self) -> Result<bool> {
		self.channel.send_no_params("is_detached").await
	}

	pub async fn detach(&self) -> Result<()> {
		self.channel.send_no_result("detach", Value::Null).await
	}

	/// Reattaches a persisted session after its connection came back.
	pub async fn resume(&self) -> Result<()> {
		self.channel.send_no_result("resume", Value::Null).await
	}

	/// Holds children the process creates until they are resumed.
	pub async fn enable_child_gating(&self) -> Result<()> {
		self.channel.send_no_result("enable_child_gating", Value::Null).await
	}

	pub async fn disable_child_gating(&self) -> Result<()> {
		self.channel.send_no_result("disable_child_gating", Value::Null).await
	}

	/// Creates a script from source. It does nothing until [`Script::load`].
	pub async fn create_script(&self, source: &str, options: ScriptOptions) -> Result<Script> {
		if source.is_empty() {
			return Err(Error::InvalidArgument("script source is empty".to_string()));
		}
		let script: HandleRef = self
			.channel
			.send("create_script", json!({ "source": source, "options": options }))
			.await?;
		debug!(pid = self.desc.pid, handle = script.handle, "script created");
		Ok(Script::adopt(&self.ctx, script.handle))
	}

	/// Creates a script from bytecode produced by [`compile_script`](Self::compile_script).
	pub async fn create_script_from_bytes(&self, bytes: &[u8], options: ScriptOptions) -> Result<Script> {
		if bytes.is_empty() {
			return Err(Error::InvalidArgument("script bytes are empty".to_string()));
		}
		let script: HandleRef = self
			.channel
			.send(
				"create_script_from_bytes",
				json!({ "bytes": TransferBuffer::new(bytes), "options": options }),
			)
			.await?;
		Ok(Script::adopt(&self.ctx, script.handle))
	}

	/// Compiles `source` to bytecode without creating a script.
	pub async fn compile_script(&self, source: &str, options: ScriptOptions) -> Result<Vec<u8>> {
		let compiled: Bytes = self
			.channel
			.send("compile_script", json!({ "source": source, "options": options }))
			.await?;
		Ok(compiled.bytes)
	}

	/// Runs `embed_script` and captures a heap snapshot for faster script startup.
	pub async fn snapshot_script(&self, embed_script: &str, options: SnapshotOptions) -> Result<Vec<u8>> {
		let snapshot: Bytes = self
			.channel
			.send(
				"snapshot_script",
				json!({ "embed_script": embed_script, "options": options }),
			)
			.await?;
		Ok(snapshot.bytes)
	}

	/// Switches the session to a direct peer-to-peer transport.
	pub async fn setup_peer_connection(&self, options: PeerOptions) -> Result<()> {
		self.channel
			.send_no_result("setup_peer_connection", json!({ "options": options }))
			.await
	}

	/// Makes the process join the portal at `address`.
	pub async fn join_portal(&self, address: &str, options: PortalOptions) -> Result<PortalMembership> {
		let membership: MembershipDescriptor = self
			.channel
			.send("join_portal", json!({ "address": address, "options": options }))
			.await?;
		Ok(PortalMembership::adopt(&self.ctx, membership))
	}

	/// Subscribes to `detached`.
	pub fn on<F>(&self, signal: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&SessionSignal) + Send + Sync + 'static,
	{
		self.signals.on(&self.channel, signal, callback)
	}

	pub fn release(self) {
		self.channel.release();
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("pid", &self.desc.pid)
			.field("handle", self.channel.handle())
			.finish()
	}
}

//! Scripts running inside an attached process.

use serde_json::Value;
use telco_protocol::{Envelope, HandleId};
use telco_runtime::{Channel, Error, HandleKind, Result};

use crate::context::Context;
use crate::handlers::Subscription;
use crate::signals::{ScriptSignal, SignalBridge};

const KIND: &str = "script";

pub struct Script {
	signals: SignalBridge<ScriptSignal>,
	channel: Channel,
}

impl Script {
	pub(crate) fn adopt(ctx: &Context, id: HandleId) -> Self {
		let channel = ctx.channel(id, HandleKind::Object, KIND);
		Self {
			signals: SignalBridge::new(ctx, &channel),
			channel,
		}
	}

	pub async fn load(&self) -> Result<()> {
		self.channel.send_no_result("load", Value::Null).await
	}

	pub async fn unload(&self) -> Result<()> {
		self.channel.send_no_result("unload", Value::Null).await
	}

	/// Keeps the script running after the session goes away.
	pub async fn eternalize(&self) -> Result<()> {
		self.channel.send_no_result("eternalize", Value::Null).await
	}

	/// Sends a JSON message, with an optional binary payload, to the script.
	///
	/// `json` must be a well-formed JSON document; it is checked before
	/// anything is sent.
	pub async fn post(&self, json: &str, data: Option<&[u8]>) -> Result<()> {
		let envelope = Envelope::new(Some(json), data);
		envelope
			.validate()
			.map_err(|e| Error::InvalidArgument(format!("message is not valid JSON: {e}")))?;
		self.channel.send_no_result("post", envelope).await
	}

	pub async fn is_destroyed(&self) -> Result<bool> {
		self.channel.send_no_params("is_destroyed").await
	}

	/// Subscribes to `message` or `destroyed`.
	pub fn on<F>(&self, signal: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&ScriptSignal) + Send + Sync + 'static,
	{
		self.signals.on(&self.channel, signal, callback)
	}

	pub fn release(self) {
		self.channel.release();
	}
}

impl std::fmt::Debug for Script {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Script").field("handle", self.channel.handle()).finish()
	}
}

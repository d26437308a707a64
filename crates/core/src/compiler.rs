//! Agent bundler.

use serde::Deserialize;
use serde_json::{Value, json};
use telco_protocol::{HandleId, HandleRef};
use telco_runtime::{Channel, Error, HandleKind, Result};

use crate::context::Context;
use crate::handlers::Subscription;
use crate::signals::{CompilerSignal, SignalBridge};

const KIND: &str = "compiler";

#[derive(Deserialize)]
struct Bundle {
	bundle: String,
}

/// Compiles script projects into a single bundle.
///
/// `diagnostics` callbacks receive only the diagnostic text.
pub struct Compiler {
	signals: SignalBridge<CompilerSignal>,
	channel: Channel,
}

impl Compiler {
	pub(crate) async fn create(ctx: &Context) -> Result<Self> {
		let created: HandleRef = ctx.call_root("compiler.new", Value::Null).await?;
		Ok(Self::adopt(ctx, created.handle))
	}

	pub(crate) fn adopt(ctx: &Context, id: HandleId) -> Self {
		let channel = ctx.channel(id, HandleKind::Object, KIND);
		Self {
			signals: SignalBridge::new(ctx, &channel),
			channel,
		}
	}

	/// Builds the project rooted at `entrypoint` and returns the bundle.
	pub async fn build(&self, entrypoint: &str) -> Result<String> {
		check_entrypoint(entrypoint)?;
		let built: Bundle = self.channel.send("build", json!({ "entrypoint": entrypoint })).await?;
		Ok(built.bundle)
	}

	/// Starts rebuilding on every change; bundles arrive through `output`.
	pub async fn watch(&self, entrypoint: &str) -> Result<()> {
		check_entrypoint(entrypoint)?;
		self.channel
			.send_no_result("watch", json!({ "entrypoint": entrypoint }))
			.await
	}

	/// Subscribes to `starting`, `finished`, `output`, `diagnostics` or `file_changed`.
	pub fn on<F>(&self, signal: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&CompilerSignal) + Send + Sync + 'static,
	{
		self.signals.on(&self.channel, signal, callback)
	}

	pub fn release(self) {
		self.channel.release();
	}
}

fn check_entrypoint(entrypoint: &str) -> Result<()> {
	if entrypoint.is_empty() {
		return Err(Error::InvalidArgument("compiler entrypoint is empty".to_string()));
	}
	Ok(())
}

impl std::fmt::Debug for Compiler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Compiler").field("handle", self.channel.handle()).finish()
	}
}

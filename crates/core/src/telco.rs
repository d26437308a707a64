//! Entry point: a connection to one engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use telco_protocol::EndpointParameters;
use telco_runtime::{Config, Connection, EngineProcess, Result, TransportParts, WebSocketTransport};
use tokio::task::JoinHandle;

use crate::compiler::Compiler;
use crate::context::Context;
use crate::device_manager::DeviceManager;
use crate::portal::PortalService;

/// A live connection to the instrumentation engine.
///
/// Every object created through it shares the connection. Dropping a
/// `Telco` that launched its engine kills the engine; prefer
/// [`shutdown`](Self::shutdown) for a clean exit.
pub struct Telco {
	ctx: Context,
	connection: Arc<Connection>,
	dispatch: JoinHandle<()>,
	/// Engine child process, present when this instance launched it.
	engine: Mutex<Option<EngineProcess>>,
}

impl Telco {
	/// Finds and launches the engine executable, then connects over its stdio.
	///
	/// # Errors
	///
	/// [`Error::EngineNotFound`](telco_runtime::Error::EngineNotFound) when no
	/// engine executable can be located, or
	/// [`Error::LaunchFailed`](telco_runtime::Error::LaunchFailed) when it
	/// exits immediately.
	pub async fn launch(config: Config) -> Result<Self> {
		tracing::debug!("launching engine");
		let mut engine = EngineProcess::launch(&config).await?;
		let parts = engine.take_transport()?;
		let telco = Self::connect(parts, config);
		*telco.engine.lock() = Some(engine);
		Ok(telco)
	}

	/// Connects over an already established transport, such as one half of
	/// [`memory_pair`](telco_runtime::memory_pair).
	pub fn connect(parts: TransportParts, config: Config) -> Self {
		let connection = Arc::new(Connection::with_queue_warning(parts, config.signal_queue_warn));

		let conn_for_loop = Arc::clone(&connection);
		let dispatch = tokio::spawn(async move {
			conn_for_loop.run().await;
		});

		Self {
			ctx: Context::new(connection.clone(), Arc::new(config)),
			connection,
			dispatch,
			engine: Mutex::new(None),
		}
	}

	/// Connects to an engine listening for WebSocket clients.
	pub async fn connect_ws(url: &str, config: Config) -> Result<Self> {
		tracing::debug!(%url, "connecting to engine via websocket");
		let (transport, message_rx) = WebSocketTransport::connect(url).await?;
		Ok(Self::connect(transport.into_transport_parts(message_rx), config))
	}

	pub fn config(&self) -> &Config {
		self.ctx.config()
	}

	/// Whether the dispatch loop has stopped, e.g. because the engine went away.
	pub fn is_closed(&self) -> bool {
		self.connection.is_closed()
	}

	/// Engine version string.
	pub async fn version(&self) -> Result<String> {
		self.ctx.call_root("version", Value::Null).await
	}

	/// Creates a new, independent device registry.
	pub async fn device_manager(&self) -> Result<DeviceManager> {
		DeviceManager::create(&self.ctx).await
	}

	/// Creates a portal with a cluster endpoint and an optional control endpoint.
	pub async fn portal(
		&self,
		cluster: EndpointParameters,
		control: Option<EndpointParameters>,
	) -> Result<PortalService> {
		PortalService::create(&self.ctx, cluster, control).await
	}

	pub async fn compiler(&self) -> Result<Compiler> {
		Compiler::create(&self.ctx).await
	}

	/// Shuts the engine down if this instance launched it and waits briefly
	/// for the dispatch loop to drain.
	pub async fn shutdown(mut self) -> Result<()> {
		let engine = self.engine.lock().take();
		if let Some(engine) = engine {
			tracing::debug!("shutting down engine");
			engine.shutdown().await?;
		}
		if tokio::time::timeout(Duration::from_secs(1), &mut self.dispatch).await.is_err() {
			tracing::debug!("dispatch loop still running, aborting");
			self.dispatch.abort();
		}
		Ok(())
	}
}

impl Drop for Telco {
	/// Kills a launched engine. The dispatch loop ends on its own once the
	/// transport closes, failing any call still in flight.
	fn drop(&mut self) {
		if let Some(mut engine) = self.engine.lock().take() {
			tracing::debug!("drop: killing engine");
			if let Err(e) = engine.process.start_kill() {
				tracing::warn!("failed to kill engine on drop: {e}");
			}
		}
	}
}

impl std::fmt::Debug for Telco {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Telco")
			.field("config", self.ctx.config())
			.field("closed", &self.is_closed())
			.field("launched", &self.engine.lock().is_some())
			.finish()
	}
}

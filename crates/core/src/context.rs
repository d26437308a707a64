//! State shared by every wrapper object created from one [`Telco`](crate::Telco).

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use telco_protocol::{HandleId, NIL_HANDLE};
use telco_runtime::{Channel, Config, ConnectionLike, Error, Handle, HandleKind, Result};

/// Connection and configuration carried into every object a call returns.
#[derive(Clone)]
pub struct Context {
	connection: Arc<dyn ConnectionLike>,
	config: Arc<Config>,
}

impl Context {
	pub(crate) fn new(connection: Arc<dyn ConnectionLike>, config: Arc<Config>) -> Self {
		Self { connection, config }
	}

	pub(crate) fn connection(&self) -> &Arc<dyn ConnectionLike> {
		&self.connection
	}

	pub(crate) fn config(&self) -> &Config {
		&self.config
	}

	pub(crate) fn handle(&self, id: HandleId, kind: HandleKind) -> Handle {
		Handle::new(Arc::clone(&self.connection), id, kind)
	}

	pub(crate) fn channel(&self, id: HandleId, kind: HandleKind, name: &'static str) -> Channel {
		Channel::new(self.handle(id, kind), name)
	}

	/// Calls a method on the engine root (handle 0).
	pub(crate) async fn call_root<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
		let params = serde_json::to_value(params)?;
		let response = self.connection.send_message(NIL_HANDLE, method, params).await?;
		serde_json::from_value(response).map_err(|e| Error::Protocol(format!("root.{method}: {e}")))
	}
}

impl std::fmt::Debug for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Context").field("config", &self.config).finish_non_exhaustive()
	}
}

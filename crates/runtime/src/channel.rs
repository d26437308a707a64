//! Channel - typed RPC proxy for one engine object.
//!
//! Every wrapper object owns a `Channel`. Calls go through the owned
//! [`Handle`], so a nil or released handle fails locally with
//! [`Error::NilHandle`] and never reaches the engine.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use telco_protocol::HandleId;

use crate::connection::{CONNECT, ConnectionLike, DISCONNECT, SignalReceiver};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleKind};

pub struct Channel {
	handle: Handle,
	kind: &'static str,
}

impl Channel {
	/// Wraps `handle`; `kind` names the object type in local errors.
	pub fn new(handle: Handle, kind: &'static str) -> Self {
		Self { handle, kind }
	}

	/// Sends a method call to the engine and decodes the response.
	pub async fn send<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
		let id = self.handle.live_id(self.kind)?;
		let params = serde_json::to_value(params)?;
		let response = self.handle.connection().send_message(id, method, params).await?;
		serde_json::from_value(response).map_err(|e| Error::Protocol(format!("{}.{method}: {e}", self.kind)))
	}

	pub async fn send_no_params<R: DeserializeOwned>(&self, method: &str) -> Result<R> {
		self.send(method, Value::Null).await
	}

	/// Sends a method call whose result carries nothing.
	pub async fn send_no_result<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
		let _: Value = self.send(method, params).await?;
		Ok(())
	}

	/// Subscribes the engine side of `signal` for this object.
	pub fn connect_signal(&self, signal: &str) -> Result<()> {
		let id = self.handle.live_id(self.kind)?;
		self.handle.connection().notify(id, CONNECT, json!({ "signal": signal }));
		Ok(())
	}

	/// Drops the engine-side subscription. Ignored on released handles.
	pub fn disconnect_signal(&self, signal: &str) {
		if let Ok(id) = self.handle.live_id(self.kind) {
			self.handle.connection().notify(id, DISCONNECT, json!({ "signal": signal }));
		}
	}

	/// Opens this object's signal FIFO.
	pub fn signals(&self) -> SignalReceiver {
		match self.handle.live_id(self.kind) {
			Ok(id) => self.handle.connection().subscribe_signals(id),
			Err(_) => SignalReceiver::closed(self.handle.id()),
		}
	}

	/// Wraps a handle returned by this object's engine calls.
	pub fn adopt(&self, id: HandleId, kind: HandleKind) -> Handle {
		Handle::new(Arc::clone(self.handle.connection()), id, kind)
	}

	pub fn handle(&self) -> &Handle {
		&self.handle
	}

	pub fn id(&self) -> HandleId {
		self.handle.id()
	}

	pub fn kind(&self) -> &'static str {
		self.kind
	}

	pub fn connection(&self) -> &Arc<dyn ConnectionLike> {
		self.handle.connection()
	}

	pub fn is_live(&self) -> bool {
		self.handle.live_id(self.kind).is_ok()
	}

	pub fn release(&self) {
		self.handle.release();
	}
}

impl std::fmt::Debug for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Channel")
			.field("kind", &self.kind)
			.field("handle", &self.handle)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handle::testing::RecordingConnection;

	#[tokio::test]
	async fn nil_channel_never_crosses_the_boundary() {
		let conn = Arc::new(RecordingConnection::default());
		let channel = Channel::new(Handle::nil(conn.clone()), "device");

		let err = channel.send_no_result("resume", json!({"pid": 1})).await.unwrap_err();
		assert!(matches!(err, Error::NilHandle { kind: "device" }));
		assert!(channel.connect_signal("lost").is_err());
		assert!(conn.requests.lock().is_empty());
		assert!(conn.notifications.lock().is_empty());
	}

	#[tokio::test]
	async fn live_channel_addresses_its_handle() {
		let conn = Arc::new(RecordingConnection::default());
		let channel = Channel::new(Handle::new(conn.clone(), 4, HandleKind::Object), "session");

		channel.send_no_result("detach", Value::Null).await.unwrap();
		channel.connect_signal("detached").unwrap();

		assert_eq!(conn.requests.lock()[0].0, 4);
		assert_eq!(conn.requests.lock()[0].1, "detach");
		assert_eq!(conn.notifications.lock()[0], (4, CONNECT.to_string()));
	}

	#[tokio::test]
	async fn released_channel_fails_locally() {
		let conn = Arc::new(RecordingConnection::default());
		let channel = Channel::new(Handle::new(conn.clone(), 4, HandleKind::Object), "script");
		channel.release();

		assert!(channel.send_no_result("load", Value::Null).await.is_err());
		assert_eq!(conn.requests.lock().len(), 0);
	}
}

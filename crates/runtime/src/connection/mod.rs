//! Request/response correlation and signal routing over a transport.
//!
//! # Message flow
//!
//! 1. A caller issues `send_message(handle, method, params)`
//! 2. The connection assigns a fresh id and parks a oneshot sender under it
//! 3. The request is queued for the writer task, which owns the transport
//! 4. The dispatch loop reads a response, looks up the id, completes the oneshot
//! 5. Events (no id) are routed to the FIFOs subscribed to their handle
//!
//! Release and subscription bookkeeping (`__unref__`, `__close__`,
//! `__connect__`, `__disconnect__`) go out as notifications: no id, no reply,
//! and they never wait, so they are safe to issue from `Drop`.

mod routes;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use telco_protocol::{ErrorCode, HandleId};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot};

pub use routes::{SignalReceiver, SignalRoutes};

use crate::error::{Error, Result};
use crate::transport::{BoxFuture, Transport, TransportParts, TransportReceiver};

/// Notification releasing one engine reference to an object.
pub const UNREF: &str = "__unref__";
/// Notification closing an engine stream.
pub const CLOSE: &str = "__close__";
/// Notification subscribing to a named signal on a handle.
pub const CONNECT: &str = "__connect__";
/// Notification dropping a signal subscription.
pub const DISCONNECT: &str = "__disconnect__";

/// What wrapper objects need from a connection.
///
/// Object safe so wrappers can hold `Arc<dyn ConnectionLike>` and tests can
/// substitute a recording double.
pub trait ConnectionLike: Send + Sync {
	/// Sends a request to the engine and awaits its response.
	fn send_message(&self, handle: HandleId, method: &str, params: Value) -> BoxFuture<'_, Result<Value>>;

	/// Queues a fire-and-forget notification. Never blocks, never fails.
	fn notify(&self, handle: HandleId, method: &str, params: Value);

	/// Opens a FIFO receiving every event the engine emits for `handle`.
	fn subscribe_signals(&self, handle: HandleId) -> SignalReceiver;
}

/// Request sent to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub id: u32,
	pub handle: HandleId,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

/// One-way message to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
	pub handle: HandleId,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

/// Engine reply to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub code: ErrorCode,
	pub message: String,
}

/// Asynchronous signal emitted by an engine object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	pub handle: HandleId,
	pub signal: String,
	#[serde(default)]
	pub params: Value,
}

/// Anything the engine can send us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
	Response(Response),
	Event(Event),
	/// Forward-compatible catch-all
	Unknown(Value),
}

/// Anything a client can send the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
	Request(Request),
	Notification(Notification),
}

type CallbackMap = Arc<TokioMutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

/// Removes the parked callback if the awaiting future is dropped early.
struct CancelGuard {
	id: u32,
	callbacks: CallbackMap,
	completed: bool,
}

impl CancelGuard {
	fn new(id: u32, callbacks: CallbackMap) -> Self {
		Self {
			id,
			callbacks,
			completed: false,
		}
	}

	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		let id = self.id;
		let callbacks = Arc::clone(&self.callbacks);

		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				if callbacks.lock().await.remove(&id).is_some() {
					tracing::debug!(id, "removed orphaned callback");
				}
			});
		}
	}
}

struct ResponseFuture {
	rx: oneshot::Receiver<Result<Value>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Connection to one engine.
pub struct Connection {
	last_id: AtomicU32,
	callbacks: CallbackMap,
	outbound_tx: mpsc::UnboundedSender<Value>,
	transport_sender: TokioMutex<Option<Box<dyn Transport>>>,
	transport_receiver: TokioMutex<Option<Box<dyn TransportReceiver>>>,
	message_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
	outbound_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
	routes: SignalRoutes,
	closed: AtomicBool,
}

impl Connection {
	pub fn new(parts: TransportParts) -> Self {
		Self::with_queue_warning(parts, 0)
	}

	/// Like [`Connection::new`], warning once a signal FIFO backs up to `warn_at` events.
	pub fn with_queue_warning(parts: TransportParts, warn_at: usize) -> Self {
		let TransportParts {
			sender,
			receiver,
			message_rx,
		} = parts;

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		Self {
			last_id: AtomicU32::new(1),
			callbacks: Arc::new(TokioMutex::new(HashMap::new())),
			outbound_tx,
			transport_sender: TokioMutex::new(Some(sender)),
			transport_receiver: TokioMutex::new(Some(receiver)),
			message_rx: TokioMutex::new(Some(message_rx)),
			outbound_rx: TokioMutex::new(Some(outbound_rx)),
			routes: SignalRoutes::new(warn_at),
			closed: AtomicBool::new(false),
		}
	}

	pub async fn send_message(&self, handle: HandleId, method: &str, params: Value) -> Result<Value> {
		let id = self.last_id.fetch_add(1, Ordering::SeqCst);

		let (tx, rx) = oneshot::channel();
		{
			let mut callbacks = self.callbacks.lock().await;
			if self.is_closed() {
				return Err(Error::ChannelClosed);
			}
			callbacks.insert(id, tx);
		}
		let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

		let request = Request {
			id,
			handle,
			method: method.to_string(),
			params,
		};
		let request_value = serde_json::to_value(&request)?;
		tracing::debug!(id, handle, method, "request");

		if self.outbound_tx.send(request_value).is_err() {
			tracing::error!(id, method, "outbound channel closed");
			return Err(Error::ChannelClosed);
		}

		ResponseFuture { rx, guard }.await
	}

	pub fn notify(&self, handle: HandleId, method: &str, params: Value) {
		let notification = Notification {
			handle,
			method: method.to_string(),
			params,
		};
		match serde_json::to_value(&notification) {
			Ok(value) => {
				tracing::trace!(handle, method, "notify");
				if self.outbound_tx.send(value).is_err() {
					tracing::debug!(handle, method, "notification dropped, connection closed");
				}
			}
			Err(e) => tracing::warn!(handle, method, "failed to encode notification: {e}"),
		}
	}

	/// Runs the dispatch loop until the transport closes.
	///
	/// Spawns the transport reader and the writer task, then routes every
	/// incoming message. On exit every pending request fails with
	/// [`Error::ChannelClosed`] and every signal FIFO ends.
	pub async fn run(self: &Arc<Self>) {
		let (Some(transport_receiver), Some(mut transport_sender), Some(mut outbound_rx), Some(mut message_rx)) = (
			self.transport_receiver.lock().await.take(),
			self.transport_sender.lock().await.take(),
			self.outbound_rx.lock().await.take(),
			self.message_rx.lock().await.take(),
		) else {
			tracing::error!("Connection::run called more than once");
			return;
		};

		let reader_handle = tokio::spawn(async move {
			if let Err(e) = transport_receiver.run().await {
				tracing::error!("transport read error: {e}");
			}
		});

		let writer_handle = tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				if let Err(e) = transport_sender.send(message).await {
					tracing::error!("transport write error: {e}");
					break;
				}
			}
		});

		while let Some(value) = message_rx.recv().await {
			match serde_json::from_value::<Message>(value) {
				Ok(message) => {
					if let Err(e) = self.dispatch_internal(message).await {
						tracing::error!("dispatch error: {e}");
					}
				}
				Err(e) => tracing::error!("failed to parse message: {e}"),
			}
		}

		tracing::debug!("engine connection closed");
		{
			let mut callbacks = self.callbacks.lock().await;
			self.closed.store(true, Ordering::SeqCst);
			callbacks.clear();
		}
		self.routes.clear();

		let _ = reader_handle.await;
		writer_handle.abort();
	}

	/// True once the dispatch loop has observed the transport closing.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	#[cfg(test)]
	pub async fn dispatch(&self, message: Message) -> Result<()> {
		self.dispatch_internal(message).await
	}

	async fn dispatch_internal(&self, message: Message) -> Result<()> {
		match message {
			Message::Response(response) => {
				let callback = self
					.callbacks
					.lock()
					.await
					.remove(&response.id)
					.ok_or_else(|| Error::Protocol(format!("no pending request with id {}", response.id)))?;

				let result = match response.error {
					Some(payload) => {
						tracing::debug!(id = response.id, code = %payload.code, "engine error");
						Err(parse_engine_error(payload))
					}
					None => {
						tracing::debug!(id = response.id, "response");
						Ok(response.result.unwrap_or(Value::Null))
					}
				};
				let _ = callback.send(result);
				Ok(())
			}
			Message::Event(event) => {
				let (handle, signal) = (event.handle, event.signal.clone());
				if self.routes.route(event) == 0 {
					tracing::warn!(handle, %signal, "event with no subscriber dropped");
				}
				Ok(())
			}
			Message::Unknown(value) => {
				tracing::warn!(%value, "unknown message ignored");
				Ok(())
			}
		}
	}
}

fn parse_engine_error(payload: ErrorPayload) -> Error {
	Error::Engine {
		code: payload.code,
		message: payload.message,
	}
}

impl ConnectionLike for Connection {
	fn send_message(&self, handle: HandleId, method: &str, params: Value) -> BoxFuture<'_, Result<Value>> {
		let method = method.to_string();
		Box::pin(async move { Connection::send_message(self, handle, &method, params).await })
	}

	fn notify(&self, handle: HandleId, method: &str, params: Value) {
		Connection::notify(self, handle, method, params)
	}

	fn subscribe_signals(&self, handle: HandleId) -> SignalReceiver {
		if self.is_closed() {
			return SignalReceiver::closed(handle);
		}
		self.routes.register(handle)
	}
}

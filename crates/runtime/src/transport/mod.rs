//! Transports carrying boundary messages to and from the engine.
//!
//! A transport is split in two: a sender half owned by the connection's
//! writer task, and a receiver half that pumps decoded messages into an
//! unbounded channel read by the connection's dispatch loop.
//!
//! - [`PipeTransport`]: engine child process stdio, 4-byte little-endian
//!   length prefix followed by UTF-8 JSON.
//! - [`WebSocketTransport`]: one JSON document per text frame.
//! - [`memory_pair`]: two cross-wired in-process endpoints.

mod memory;
mod websocket;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub use memory::{MemoryTransportReceiver, MemoryTransportSender, memory_pair};
pub use websocket::{WebSocketTransport, WebSocketTransportReceiver, WebSocketTransportSender};

use crate::error::{Error, Result};

/// Boxed send-able future used by the object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Frames larger than this are rejected rather than allocated.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Outbound half of a transport.
pub trait Transport: Send {
	fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>>;
}

/// Inbound half of a transport. `run` pumps until the peer goes away.
pub trait TransportReceiver: Send {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Everything a [`Connection`](crate::Connection) needs from a transport.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Length-prefixed JSON over a pair of byte pipes.
pub struct PipeTransport<W, R> {
	sender: PipeTransportSender<W>,
	receiver: PipeTransportReceiver<R>,
}

pub struct PipeTransportSender<W> {
	stdin: W,
}

pub struct PipeTransportReceiver<R> {
	stdout: R,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl<W, R> PipeTransport<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Creates a transport writing to `stdin` and reading from `stdout`.
	///
	/// Returns the transport and the receiver that decoded messages land in.
	pub fn new(stdin: W, stdout: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let transport = Self {
			sender: PipeTransportSender { stdin },
			receiver: PipeTransportReceiver { stdout, message_tx },
		};
		(transport, message_rx)
	}

	pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
		(self.sender, self.receiver)
	}

	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
		TransportParts {
			sender: Box::new(self.sender),
			receiver: Box::new(self.receiver),
			message_rx,
		}
	}

	pub async fn send(&mut self, message: Value) -> Result<()> {
		self.sender.send(message).await
	}

	/// Reads frames until the pipe closes or the message receiver is dropped.
	pub async fn run(&mut self) -> Result<()> {
		self.receiver.read_loop().await
	}
}

impl<W: AsyncWrite + Unpin + Send> PipeTransportSender<W> {
	pub async fn send(&mut self, message: Value) -> Result<()> {
		let bytes = serde_json::to_vec(&message)?;
		let len = u32::try_from(bytes.len())
			.map_err(|_| Error::Transport(format!("message too large: {} bytes", bytes.len())))?;

		self.stdin
			.write_all(&len.to_le_bytes())
			.await
			.map_err(|e| Error::Transport(format!("Failed to write length prefix: {e}")))?;
		self.stdin
			.write_all(&bytes)
			.await
			.map_err(|e| Error::Transport(format!("Failed to write message body: {e}")))?;
		self.stdin
			.flush()
			.await
			.map_err(|e| Error::Transport(format!("Failed to flush: {e}")))?;
		Ok(())
	}
}

impl<R: AsyncRead + Unpin + Send> PipeTransportReceiver<R> {
	async fn read_loop(&mut self) -> Result<()> {
		loop {
			let mut len_buf = [0u8; 4];
			self.stdout
				.read_exact(&mut len_buf)
				.await
				.map_err(|e| Error::Transport(format!("Failed to read length prefix: {e}")))?;

			let len = u32::from_le_bytes(len_buf) as usize;
			if len > MAX_FRAME_LEN {
				return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
			}

			let mut body = vec![0u8; len];
			self.stdout
				.read_exact(&mut body)
				.await
				.map_err(|e| Error::Transport(format!("Failed to read message body: {e}")))?;

			let message: Value = match serde_json::from_slice(&body) {
				Ok(message) => message,
				Err(e) => {
					tracing::warn!(len, error = %e, "skipping frame that is not JSON");
					continue;
				}
			};
			if self.message_tx.send(message).is_err() {
				tracing::debug!("message receiver dropped, stopping pipe reader");
				return Ok(());
			}
		}
	}
}

impl<W: AsyncWrite + Unpin + Send> Transport for PipeTransportSender<W> {
	fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
		Box::pin(PipeTransportSender::send(self, message))
	}
}

impl<R: AsyncRead + Unpin + Send + 'static> TransportReceiver for PipeTransportReceiver<R> {
	fn run(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin(async move { self.read_loop().await })
	}
}

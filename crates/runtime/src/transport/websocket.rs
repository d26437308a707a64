use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{BoxFuture, Transport, TransportParts, TransportReceiver};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON messages over a WebSocket, one document per frame.
pub struct WebSocketTransport {
	sender: WebSocketTransportSender,
	receiver: WebSocketTransportReceiver,
}

pub struct WebSocketTransportSender {
	sink: SplitSink<WsStream, Message>,
}

pub struct WebSocketTransportReceiver {
	stream: SplitStream<WsStream>,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl WebSocketTransport {
	/// Connects to an engine listening at `url` (`ws://` or `wss://`).
	pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
		let (ws, _response) = connect_async(url)
			.await
			.map_err(|e| Error::Transport(format!("WebSocket connect to {url} failed: {e}")))?;
		tracing::debug!(%url, "websocket connected");

		let (sink, stream) = ws.split();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let transport = Self {
			sender: WebSocketTransportSender { sink },
			receiver: WebSocketTransportReceiver { stream, message_tx },
		};
		Ok((transport, message_rx))
	}

	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
		TransportParts {
			sender: Box::new(self.sender),
			receiver: Box::new(self.receiver),
			message_rx,
		}
	}
}

impl WebSocketTransportReceiver {
	async fn read_loop(mut self) -> Result<()> {
		while let Some(frame) = self.stream.next().await {
			let frame = frame.map_err(|e| Error::Transport(format!("WebSocket read failed: {e}")))?;
			let message: Value = match frame {
				Message::Text(text) => serde_json::from_str(&text)?,
				Message::Binary(bytes) => serde_json::from_slice(&bytes)?,
				Message::Close(_) => return Ok(()),
				_ => continue,
			};
			if self.message_tx.send(message).is_err() {
				return Ok(());
			}
		}
		Ok(())
	}
}

impl Transport for WebSocketTransportSender {
	fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let text = serde_json::to_string(&message)?;
			self.sink
				.send(Message::Text(text))
				.await
				.map_err(|e| Error::Transport(format!("WebSocket write failed: {e}")))
		})
	}
}

impl TransportReceiver for WebSocketTransportReceiver {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin((*self).read_loop())
	}
}

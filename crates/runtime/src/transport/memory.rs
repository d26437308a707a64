use serde_json::Value;
use tokio::sync::mpsc;

use super::{BoxFuture, Transport, TransportParts, TransportReceiver};
use crate::error::{Error, Result};

/// Sender half of an in-process transport; writes straight into the peer's queue.
pub struct MemoryTransportSender {
	peer: mpsc::UnboundedSender<Value>,
}

/// Receiver half of an in-process transport.
///
/// Messages are pushed directly into the message channel by the peer, so there
/// is nothing to pump.
pub struct MemoryTransportReceiver;

/// Creates two cross-wired endpoints: whatever one side sends, the other
/// side's `message_rx` yields, in order.
pub fn memory_pair() -> (TransportParts, TransportParts) {
	let (a_tx, a_rx) = mpsc::unbounded_channel();
	let (b_tx, b_rx) = mpsc::unbounded_channel();

	let a = TransportParts {
		sender: Box::new(MemoryTransportSender { peer: b_tx }),
		receiver: Box::new(MemoryTransportReceiver),
		message_rx: a_rx,
	};
	let b = TransportParts {
		sender: Box::new(MemoryTransportSender { peer: a_tx }),
		receiver: Box::new(MemoryTransportReceiver),
		message_rx: b_rx,
	};
	(a, b)
}

impl Transport for MemoryTransportSender {
	fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
		let sent = self.peer.send(message).map_err(|_| Error::ChannelClosed);
		Box::pin(async move { sent })
	}
}

impl TransportReceiver for MemoryTransportReceiver {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin(async { Ok(()) })
	}
}

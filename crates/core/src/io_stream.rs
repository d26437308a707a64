//! Raw byte stream opened with [`Device::open_channel`](crate::Device::open_channel).

use serde::Deserialize;
use serde_json::{Value, json};
use telco_protocol::buffer::base64_bytes;
use telco_protocol::{HandleId, TransferBuffer};
use telco_runtime::{Channel, Error, HandleKind, Result};

use crate::context::Context;

const KIND: &str = "stream";

#[derive(Deserialize)]
struct ReadResult {
	#[serde(with = "base64_bytes")]
	data: Vec<u8>,
}

/// Bidirectional stream to a device-side service.
///
/// Dropping an open stream closes it on the engine side.
#[derive(Debug)]
pub struct IoStream {
	channel: Channel,
}

impl IoStream {
	pub(crate) fn adopt(ctx: &Context, id: HandleId) -> Self {
		Self {
			channel: ctx.channel(id, HandleKind::Stream, KIND),
		}
	}

	/// Reads up to `count` bytes. An empty result means end of stream.
	pub async fn read(&self, count: usize) -> Result<Vec<u8>> {
		let result: ReadResult = self.channel.send("read", json!({ "count": count })).await?;
		Ok(result.data)
	}

	/// Writes some prefix of `data` and returns how many bytes were taken.
	pub async fn write(&self, data: &[u8]) -> Result<usize> {
		self.channel
			.send("write", json!({ "data": TransferBuffer::new(data) }))
			.await
	}

	/// Writes all of `data`, issuing as many writes as needed.
	pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
		while !data.is_empty() {
			let written = self.write(data).await?;
			if written == 0 {
				return Err(Error::Transport("stream accepted no bytes".to_string()));
			}
			data = data.get(written..).unwrap_or_default();
		}
		Ok(())
	}

	/// Closes the stream and waits for the engine to confirm.
	pub async fn close(self) -> Result<()> {
		let result = self.channel.send_no_result("close", Value::Null).await;
		if result.is_ok() {
			self.channel.handle().disarm();
		}
		result
	}

	pub fn is_closed(&self) -> bool {
		!self.channel.is_live()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use telco_runtime::{Config, Connection, memory_pair};

	use super::*;

	#[tokio::test]
	async fn nil_stream_refuses_io() {
		let (client, _engine) = memory_pair();
		let ctx = Context::new(Arc::new(Connection::new(client)), Arc::new(Config::default()));
		let stream = IoStream::adopt(&ctx, 0);

		assert!(stream.is_closed());
		assert!(matches!(stream.read(16).await, Err(Error::NilHandle { kind: KIND })));
		assert!(matches!(stream.write_all(b"abc").await, Err(Error::NilHandle { .. })));
		assert!(stream.write_all(b"").await.is_ok());
	}
}

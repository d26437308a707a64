//! Cluster hub that nodes join and controllers talk through.
//!
//! Messages travel as an [`Envelope`]: an optional JSON metadata document
//! plus an optional raw payload. Connections carry a caller-managed tag set used
//! by [`PortalService::narrowcast`].

use serde::Serialize;
use serde_json::{Value, json};
use telco_protocol::{DeviceDescriptor, EndpointParameters, Envelope, HandleRef};
use telco_runtime::{Channel, Error, HandleKind, Result};
use tracing::debug;

use crate::context::Context;
use crate::device::Device;
use crate::handlers::Subscription;
use crate::signals::{PortalSignal, SignalBridge};

const KIND: &str = "portal";

#[derive(Serialize)]
struct Addressed<'a, T: Serialize> {
	#[serde(flatten)]
	target: T,
	#[serde(flatten)]
	envelope: Envelope<'a>,
}

/// Metadata is checked only when present; payload-only messages are allowed.
fn envelope<'a>(json: Option<&'a str>, data: Option<&'a [u8]>) -> Result<Envelope<'a>> {
	let envelope = Envelope::new(json, data);
	envelope
		.validate()
		.map_err(|e| Error::InvalidArgument(format!("message is not valid JSON: {e}")))?;
	Ok(envelope)
}

pub struct PortalService {
	ctx: Context,
	cluster: EndpointParameters,
	control: Option<EndpointParameters>,
	signals: SignalBridge<PortalSignal>,
	channel: Channel,
}

impl PortalService {
	pub(crate) async fn create(
		ctx: &Context,
		cluster: EndpointParameters,
		control: Option<EndpointParameters>,
	) -> Result<Self> {
		let created: HandleRef = ctx
			.call_root("portal.new", json!({ "cluster": cluster, "control": control }))
			.await?;
		debug!(handle = created.handle, port = cluster.port, "portal created");

		let channel = ctx.channel(created.handle, HandleKind::Object, KIND);
		Ok(Self {
			ctx: ctx.clone(),
			cluster,
			control,
			signals: SignalBridge::new(ctx, &channel),
			channel,
		})
	}

	/// The device representing the processes joined to this portal.
	pub async fn device(&self) -> Result<Device> {
		let desc: DeviceDescriptor = self.channel.send_no_params("get_device").await?;
		Ok(Device::adopt(&self.ctx, desc, HandleKind::Object))
	}

	/// Endpoint nodes connect to.
	pub fn cluster_params(&self) -> &EndpointParameters {
		&self.cluster
	}

	/// Endpoint controllers connect to, when one was configured.
	pub fn control_params(&self) -> Option<&EndpointParameters> {
		self.control.as_ref()
	}

	/// Binds both endpoints.
	pub async fn start(&self) -> Result<()> {
		self.channel.send_no_result("start", Value::Null).await
	}

	/// Unbinds both endpoints and drops every connection.
	pub async fn stop(&self) -> Result<()> {
		self.channel.send_no_result("stop", Value::Null).await
	}

	/// Disconnects one connection.
	pub async fn kick(&self, connection_id: u32) -> Result<()> {
		self.channel
			.send_no_result("kick", json!({ "connection_id": connection_id }))
			.await
	}

	/// Sends a message to one connection.
	pub async fn post(&self, connection_id: u32, json: Option<&str>, data: Option<&[u8]>) -> Result<()> {
		let message = Addressed {
			target: json!({ "connection_id": connection_id }),
			envelope: envelope(json, data)?,
		};
		self.channel.send_no_result("post", message).await
	}

	/// Sends a message to every connection tagged `tag`. No holders is not an error.
	pub async fn narrowcast(&self, tag: &str, json: Option<&str>, data: Option<&[u8]>) -> Result<()> {
		let message = Addressed {
			target: json!({ "tag": tag }),
			envelope: envelope(json, data)?,
		};
		self.channel.send_no_result("narrowcast", message).await
	}

	/// Sends a message to every connection.
	pub async fn broadcast(&self, json: Option<&str>, data: Option<&[u8]>) -> Result<()> {
		self.channel.send_no_result("broadcast", envelope(json, data)?).await
	}

	/// Tags currently held by a connection, sorted.
	pub async fn enumerate_tags(&self, connection_id: u32) -> Result<Vec<String>> {
		let mut tags: Vec<String> = self
			.channel
			.send("enumerate_tags", json!({ "connection_id": connection_id }))
			.await?;
		tags.sort();
		Ok(tags)
	}

	pub async fn tag_connection(&self, connection_id: u32, tag: &str) -> Result<()> {
		check_tag(tag)?;
		self.channel
			.send_no_result("tag", json!({ "connection_id": connection_id, "tag": tag }))
			.await
	}

	pub async fn untag_connection(&self, connection_id: u32, tag: &str) -> Result<()> {
		check_tag(tag)?;
		self.channel
			.send_no_result("untag", json!({ "connection_id": connection_id, "tag": tag }))
			.await
	}

	/// Subscribes to a lifecycle or message signal (`node_connected`, `message`, ...).
	pub fn on<F>(&self, signal: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&PortalSignal) + Send + Sync + 'static,
	{
		self.signals.on(&self.channel, signal, callback)
	}

	pub fn release(self) {
		self.channel.release();
	}
}

fn check_tag(tag: &str) -> Result<()> {
	if tag.is_empty() {
		return Err(Error::InvalidArgument("tag is empty".to_string()));
	}
	Ok(())
}

impl std::fmt::Debug for PortalService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PortalService")
			.field("cluster", &self.cluster)
			.field("control", &self.control)
			.field("handle", self.channel.handle())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn addressed_messages_flatten_the_envelope() {
		let message = Addressed {
			target: json!({ "tag": "A" }),
			envelope: Envelope::new(Some(r#"{"op":"sync"}"#), Some(b"\x00")),
		};
		assert_eq!(
			serde_json::to_value(message).unwrap(),
			json!({ "tag": "A", "json": "{\"op\":\"sync\"}", "data": "AA==" })
		);
	}

	#[test]
	fn malformed_json_is_rejected_locally() {
		assert!(matches!(envelope(Some("{oops"), None), Err(Error::InvalidArgument(_))));
		assert!(envelope(Some("{}"), Some(b"raw")).is_ok());
	}

	#[test]
	fn payload_only_messages_skip_json_checks() {
		let envelope = envelope(None, Some(b"\x01\x02")).unwrap();
		assert_eq!(serde_json::to_value(envelope).unwrap(), json!({ "data": "AQI=" }));
	}
}

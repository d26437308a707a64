//! Registry of the devices an engine can reach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use telco_protocol::{DeviceDescriptor, DeviceType, HandleId, HandleRef, ListDescriptor, RemoteDeviceOptions};
use telco_runtime::{Channel, Error, HandleKind, Result};
use tracing::debug;

use crate::context::Context;
use crate::device::Device;
use crate::handlers::Subscription;
use crate::signals::{ManagerSignal, SignalBridge};

const KIND: &str = "device manager";

/// Owns one engine-side device registry.
///
/// Each instance is independent. After [`close`](Self::close) every call
/// fails with [`Error::Closed`].
pub struct DeviceManager {
	ctx: Context,
	signals: SignalBridge<ManagerSignal>,
	channel: Channel,
	closed: AtomicBool,
}

impl DeviceManager {
	pub(crate) async fn create(ctx: &Context) -> Result<Self> {
		let created: HandleRef = ctx.call_root("device_manager.new", Value::Null).await?;
		debug!(handle = created.handle, "device manager created");
		Ok(Self::adopt(ctx, created.handle, HandleKind::Object))
	}

	pub(crate) fn adopt(ctx: &Context, id: HandleId, kind: HandleKind) -> Self {
		let channel = ctx.channel(id, kind, KIND);
		Self {
			ctx: ctx.clone(),
			signals: SignalBridge::new(ctx, &channel),
			channel,
			closed: AtomicBool::new(false),
		}
	}

	fn open(&self) -> Result<&Channel> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::Closed { kind: KIND });
		}
		Ok(&self.channel)
	}

	fn wrap(&self, desc: DeviceDescriptor) -> Device {
		Device::adopt(&self.ctx, desc, HandleKind::Object)
	}

	/// All devices currently known to the engine.
	pub async fn enumerate_devices(&self) -> Result<Vec<Device>> {
		let list: ListDescriptor<DeviceDescriptor> = self.open()?.send_no_params("enumerate_devices").await?;
		// The list is its own reference; elements stay valid once it is gone.
		drop(self.channel.adopt(list.list, HandleKind::Object));
		Ok(list.items.into_iter().map(|desc| self.wrap(desc)).collect())
	}

	/// Device with `id`, failing immediately with a not-found error if absent.
	pub async fn device_by_id(&self, id: &str) -> Result<Device> {
		let desc = self.open()?.send("get_device_by_id", json!({ "id": id })).await?;
		Ok(self.wrap(desc))
	}

	/// First device of `kind`, failing immediately if there is none.
	pub async fn device_by_type(&self, kind: DeviceType) -> Result<Device> {
		let desc = self.open()?.send("get_device_by_type", json!({ "type": kind })).await?;
		Ok(self.wrap(desc))
	}

	/// Waits up to `timeout` (default: `Config::device_timeout`) for a device
	/// with `id` to appear. Fails with a timed-out error otherwise.
	pub async fn find_device_by_id(&self, id: &str, timeout: Option<Duration>) -> Result<Device> {
		let timeout = self.timeout_ms(timeout);
		let desc = self
			.open()?
			.send("find_device_by_id", json!({ "id": id, "timeout": timeout }))
			.await?;
		Ok(self.wrap(desc))
	}

	/// Waits up to `timeout` for a device of `kind` to appear.
	pub async fn find_device_by_type(&self, kind: DeviceType, timeout: Option<Duration>) -> Result<Device> {
		let timeout = self.timeout_ms(timeout);
		let desc = self
			.open()?
			.send("find_device_by_type", json!({ "type": kind, "timeout": timeout }))
			.await?;
		Ok(self.wrap(desc))
	}

	pub async fn local_device(&self) -> Result<Device> {
		self.device_by_type(DeviceType::Local).await
	}

	pub async fn usb_device(&self) -> Result<Device> {
		self.device_by_type(DeviceType::Usb).await
	}

	pub async fn remote_device(&self) -> Result<Device> {
		self.device_by_type(DeviceType::Remote).await
	}

	/// Connects to an engine listening at `address` and registers it as a device.
	pub async fn add_remote_device(&self, address: &str, options: RemoteDeviceOptions) -> Result<Device> {
		if address.is_empty() {
			return Err(Error::InvalidArgument("remote device address is empty".to_string()));
		}
		let desc = self
			.open()?
			.send("add_remote_device", json!({ "address": address, "options": options }))
			.await?;
		Ok(self.wrap(desc))
	}

	pub async fn remove_remote_device(&self, address: &str) -> Result<()> {
		self.open()?
			.send_no_result("remove_remote_device", json!({ "address": address }))
			.await
	}

	/// Shuts the registry down. The manager is unusable afterwards; a second
	/// close is a no-op. If the engine refuses, the manager stays open and
	/// the close can be retried.
	pub async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		let closed = self.channel.send_no_result("close", Value::Null).await;
		if closed.is_err() {
			self.closed.store(false, Ordering::Release);
		}
		closed
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Subscribes to `added`, `removed` or `changed`.
	pub fn on<F>(&self, signal: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&ManagerSignal) + Send + Sync + 'static,
	{
		self.signals.on(self.open()?, signal, callback)
	}

	/// Releases the engine reference.
	pub fn release(self) {
		self.channel.release();
	}

	fn timeout_ms(&self, timeout: Option<Duration>) -> u64 {
		let timeout = timeout.unwrap_or(self.ctx.config().device_timeout);
		u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
	}
}

impl std::fmt::Debug for DeviceManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DeviceManager")
			.field("handle", self.channel.handle())
			.field("closed", &self.is_closed())
			.finish()
	}
}

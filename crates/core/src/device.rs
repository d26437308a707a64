//! A single execution environment: the local host, a USB unit or a remote engine.

use serde_json::{Map, Value, json};
use telco_protocol::{
	ApplicationDescriptor, ApplicationQueryOptions, Bus, ChildDescriptor, DeviceDescriptor, DeviceType,
	FrontmostQueryOptions, HandleRef, Icon, ListDescriptor, ProcessDescriptor, ProcessMatchOptions,
	ProcessQueryOptions, Scope, SessionDescriptor, SessionOptions, SpawnDescriptor, SpawnOptions, TransferBuffer,
};
use telco_runtime::{Channel, Error, HandleKind, Result};
use tracing::debug;

use crate::context::Context;
use crate::device_manager::DeviceManager;
use crate::handlers::Subscription;
use crate::io_stream::IoStream;
use crate::process::{Application, Child, Process, Spawn};
use crate::session::Session;
use crate::signals::{DeviceSignal, SignalBridge};
use crate::target::Target;

const KIND: &str = "device";

/// Handle to one device.
///
/// Identity (`id`, `name`, type, bus, icon) is captured when the device is
/// returned and never changes. Every operation on a nil or released device
/// fails with [`Error::NilHandle`] before reaching the engine.
pub struct Device {
	ctx: Context,
	desc: DeviceDescriptor,
	signals: SignalBridge<DeviceSignal>,
	channel: Channel,
}

impl Device {
	pub(crate) fn adopt(ctx: &Context, desc: DeviceDescriptor, kind: HandleKind) -> Self {
		let channel = ctx.channel(desc.handle, kind, KIND);
		Self {
			ctx: ctx.clone(),
			signals: SignalBridge::new(ctx, &channel),
			channel,
			desc,
		}
	}

	/// Stable opaque identifier.
	pub fn id(&self) -> &str {
		&self.desc.id
	}

	pub fn name(&self) -> &str {
		&self.desc.name
	}

	pub fn device_type(&self) -> DeviceType {
		self.desc.kind
	}

	pub fn bus(&self) -> Bus {
		self.desc.bus
	}

	pub fn icon(&self) -> Option<&Icon> {
		self.desc.icon.as_ref()
	}

	pub(crate) fn handle_kind(&self) -> HandleKind {
		self.channel.handle().kind()
	}

	/// Whether the engine has lost contact with the device. A lost device
	/// still has to be released.
	pub async fn is_lost(&self) -> Result<bool> {
		self.channel.send_no_params("is_lost").await
	}

	/// The manager this device belongs to, as a new reference.
	pub async fn manager(&self) -> Result<DeviceManager> {
		let manager: HandleRef = self.channel.send_no_params("get_manager").await?;
		Ok(DeviceManager::adopt(&self.ctx, manager.handle, HandleKind::Object))
	}

	/// System properties (OS, architecture, hostname, ...).
	pub async fn query_system_parameters(&self) -> Result<Map<String, Value>> {
		self.channel.send_no_params("query_system_parameters").await
	}

	/// Alias for [`query_system_parameters`](Self::query_system_parameters).
	pub async fn params(&self) -> Result<Map<String, Value>> {
		self.query_system_parameters().await
	}

	/// Application in the foreground, or `None` when nothing is focused.
	pub async fn frontmost_application(&self, scope: Scope) -> Result<Option<Application>> {
		let options = FrontmostQueryOptions { scope };
		let app: Option<ApplicationDescriptor> = self
			.channel
			.send("get_frontmost_application", json!({ "options": options }))
			.await?;
		Ok(app.map(|desc| Application::adopt(&self.ctx, desc, HandleKind::Object)))
	}

	/// Installed applications, ordered by descending pid.
	///
	/// Not-running applications (pid 0) come last. Entries with equal pids
	/// keep the order the engine returned them in.
	pub async fn enumerate_applications(&self, options: &ApplicationQueryOptions) -> Result<Vec<Application>> {
		let list: ListDescriptor<ApplicationDescriptor> = self
			.channel
			.send("enumerate_applications", json!({ "options": options }))
			.await?;
		drop(self.channel.adopt(list.list, HandleKind::Object));

		let mut apps: Vec<Application> = list
			.items
			.into_iter()
			.map(|desc| Application::adopt(&self.ctx, desc, HandleKind::Object))
			.collect();
		apps.sort_by(|a, b| b.pid().cmp(&a.pid()));
		Ok(apps)
	}

	pub async fn enumerate_processes(&self, options: &ProcessQueryOptions) -> Result<Vec<Process>> {
		let list: ListDescriptor<ProcessDescriptor> = self
			.channel
			.send("enumerate_processes", json!({ "options": options }))
			.await?;
		drop(self.channel.adopt(list.list, HandleKind::Object));
		Ok(list.items.into_iter().map(|desc| self.process(desc)).collect())
	}

	/// Process with `pid`, failing immediately if it does not exist.
	pub async fn process_by_pid(&self, pid: u32, scope: Scope) -> Result<Process> {
		let desc = self
			.channel
			.send("get_process_by_pid", json!({ "pid": pid, "options": self.match_options(scope) }))
			.await?;
		Ok(self.process(desc))
	}

	/// First process called `name`, failing immediately if there is none.
	pub async fn process_by_name(&self, name: &str, scope: Scope) -> Result<Process> {
		let desc = self
			.channel
			.send("get_process_by_name", json!({ "name": name, "options": self.match_options(scope) }))
			.await?;
		Ok(self.process(desc))
	}

	/// Waits up to `Config::process_timeout` for a process with `pid`.
	pub async fn find_process_by_pid(&self, pid: u32, scope: Scope) -> Result<Process> {
		let desc = self
			.channel
			.send("find_process_by_pid", json!({ "pid": pid, "options": self.match_options(scope) }))
			.await?;
		Ok(self.process(desc))
	}

	/// Waits up to `Config::process_timeout` for a process called `name`.
	pub async fn find_process_by_name(&self, name: &str, scope: Scope) -> Result<Process> {
		let desc = self
			.channel
			.send("find_process_by_name", json!({ "name": name, "options": self.match_options(scope) }))
			.await?;
		Ok(self.process(desc))
	}

	/// Makes the engine hold every new process suspended until resumed.
	pub async fn enable_spawn_gating(&self) -> Result<()> {
		self.channel.send_no_result("enable_spawn_gating", Value::Null).await
	}

	pub async fn disable_spawn_gating(&self) -> Result<()> {
		self.channel.send_no_result("disable_spawn_gating", Value::Null).await
	}

	pub async fn enumerate_pending_spawn(&self) -> Result<Vec<Spawn>> {
		let list: ListDescriptor<SpawnDescriptor> = self.channel.send_no_params("enumerate_pending_spawn").await?;
		drop(self.channel.adopt(list.list, HandleKind::Object));
		Ok(list
			.items
			.into_iter()
			.map(|desc| Spawn::adopt(&self.ctx, desc, HandleKind::Object))
			.collect())
	}

	pub async fn enumerate_pending_children(&self) -> Result<Vec<Child>> {
		let list: ListDescriptor<ChildDescriptor> = self.channel.send_no_params("enumerate_pending_children").await?;
		drop(self.channel.adopt(list.list, HandleKind::Object));
		Ok(list
			.items
			.into_iter()
			.map(|desc| Child::adopt(&self.ctx, desc, HandleKind::Object))
			.collect())
	}

	/// Launches `program` suspended and returns its pid. The options are consumed.
	pub async fn spawn(&self, program: &str, options: SpawnOptions) -> Result<u32> {
		if program.is_empty() {
			return Err(Error::InvalidArgument("program to spawn is empty".to_string()));
		}
		let pid = self
			.channel
			.send("spawn", json!({ "program": program, "options": options }))
			.await?;
		debug!(program, pid, "spawned");
		Ok(pid)
	}

	/// Writes `data` to the stdin of a process spawned with piped stdio.
	///
	/// `data` is borrowed for the duration of the call only.
	pub async fn input(&self, pid: u32, data: &[u8]) -> Result<()> {
		self.channel
			.send_no_result("input", json!({ "pid": pid, "data": TransferBuffer::new(data) }))
			.await
	}

	pub async fn resume(&self, pid: u32) -> Result<()> {
		self.channel.send_no_result("resume", json!({ "pid": pid })).await
	}

	pub async fn kill(&self, pid: u32) -> Result<()> {
		self.channel.send_no_result("kill", json!({ "pid": pid })).await
	}

	/// Attaches to a process by name or pid.
	pub async fn attach(&self, target: impl Into<Target>, options: SessionOptions) -> Result<Session> {
		let pid = self.resolve(target.into()).await?;
		let desc: SessionDescriptor = self
			.channel
			.send("attach", json!({ "pid": pid, "options": options }))
			.await?;
		debug!(pid, handle = desc.handle, "attached");
		Ok(Session::adopt(&self.ctx, desc))
	}

	/// Loads the library at `path` (a path on the device) into the target and
	/// calls `entrypoint` with `data`. Returns the injection id.
	pub async fn inject_library_file(
		&self,
		target: impl Into<Target>,
		path: &str,
		entrypoint: &str,
		data: &str,
	) -> Result<u32> {
		if path.is_empty() {
			return Err(Error::InvalidArgument("library path is empty".to_string()));
		}
		self.channel.handle().live_id(KIND)?;
		let pid = self.resolve(target.into()).await?;
		self.channel
			.send(
				"inject_library_file",
				json!({
					"pid": pid,
					"path": path,
					"entrypoint": non_empty(entrypoint),
					"data": non_empty(data),
				}),
			)
			.await
	}

	/// Like [`inject_library_file`](Self::inject_library_file) with the
	/// library image sent inline. `blob` is borrowed for the duration of the call.
	pub async fn inject_library_blob(
		&self,
		target: impl Into<Target>,
		blob: &[u8],
		entrypoint: &str,
		data: &str,
	) -> Result<u32> {
		if blob.is_empty() {
			return Err(Error::InvalidArgument("library blob is empty".to_string()));
		}
		self.channel.handle().live_id(KIND)?;
		let pid = self.resolve(target.into()).await?;
		self.channel
			.send(
				"inject_library_blob",
				json!({
					"pid": pid,
					"blob": TransferBuffer::new(blob),
					"entrypoint": non_empty(entrypoint),
					"data": non_empty(data),
				}),
			)
			.await
	}

	/// Opens a raw byte stream to a service on the device, e.g. `tcp:1234`.
	pub async fn open_channel(&self, address: &str) -> Result<IoStream> {
		let stream: HandleRef = self.channel.send("open_channel", json!({ "address": address })).await?;
		Ok(IoStream::adopt(&self.ctx, stream.handle))
	}

	/// Subscribes to one of the device signals (`spawn_added`, `output`, `lost`, ...).
	pub fn on<F>(&self, signal: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&DeviceSignal) + Send + Sync + 'static,
	{
		self.signals.on(&self.channel, signal, callback)
	}

	/// Releases the engine reference.
	pub fn release(self) {
		self.channel.release();
	}

	async fn resolve(&self, target: Target) -> Result<u32> {
		match target {
			Target::Pid(pid) => Ok(pid),
			Target::Name(name) => {
				let process = self.process_by_name(&name, Scope::Minimal).await?;
				Ok(process.pid())
			}
		}
	}

	fn process(&self, desc: ProcessDescriptor) -> Process {
		Process::adopt(&self.ctx, desc, HandleKind::Object)
	}

	fn match_options(&self, scope: Scope) -> ProcessMatchOptions {
		ProcessMatchOptions::new(self.ctx.config().process_timeout_ms(), scope)
	}
}

fn non_empty(s: &str) -> Option<&str> {
	(!s.is_empty()).then_some(s)
}

impl std::fmt::Debug for Device {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Device")
			.field("id", &self.desc.id)
			.field("name", &self.desc.name)
			.field("type", &self.desc.kind)
			.field("handle", self.channel.handle())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use telco_protocol::NIL_HANDLE;
	use telco_runtime::{Config, Connection, memory_pair};

	use super::*;

	fn nil_device() -> Device {
		let (client, _engine) = memory_pair();
		let ctx = Context::new(Arc::new(Connection::new(client)), Arc::new(Config::default()));
		let desc = DeviceDescriptor {
			handle: NIL_HANDLE,
			id: "gone".to_string(),
			name: "Gone".to_string(),
			kind: DeviceType::Remote,
			bus: Bus::Network,
			icon: None,
		};
		Device::adopt(&ctx, desc, HandleKind::Object)
	}

	#[tokio::test]
	async fn nil_device_guards_every_call() {
		let device = nil_device();
		let nil = |e: Error| matches!(e, Error::NilHandle { kind: KIND });

		assert!(nil(device.resume(1).await.unwrap_err()));
		assert!(nil(device.spawn("/bin/true", SpawnOptions::new()).await.unwrap_err()));
		assert!(nil(device.attach(1u32, SessionOptions::default()).await.unwrap_err()));
		assert!(nil(device.attach("init", SessionOptions::default()).await.unwrap_err()));
		assert!(nil(device.inject_library_file(1u32, "/lib/x.so", "", "").await.unwrap_err()));
		assert!(nil(device.open_channel("tcp:1").await.unwrap_err()));
		assert!(nil(device.on("lost", |_| {}).unwrap_err()));
	}

	#[tokio::test]
	async fn empty_library_arguments_are_rejected_first() {
		let device = nil_device();
		let err = device.inject_library_file(1u32, "", "main", "").await.unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)));
		let err = device.inject_library_blob("init", &[], "main", "").await.unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)));
	}

	#[test]
	fn identity_comes_from_the_descriptor() {
		let device = nil_device();
		assert_eq!(device.id(), "gone");
		assert_eq!(device.device_type(), DeviceType::Remote);
		assert_eq!(device.bus(), Bus::Network);
		assert!(device.icon().is_none());
	}
}

//! telco-sim - an in-process stand-in for the instrumentation engine
//!
//! Speaks the same boundary protocol as the real engine over an in-memory
//! transport, so the `telco` crate can be driven end to end without a device.
//! The test (or the CLI's `--sim` mode) plays the outside world through
//! [`Simulator`]: plugging devices in, launching and crashing processes,
//! connecting portal peers.
//!
//! ```ignore
//! let sim = telco_sim::Simulator::new();
//! let telco = telco::Telco::connect(sim.connect(), telco::Config::default());
//! sim.add_process("local", 4242, "notes")?;
//! ```

mod engine;
mod portal;
mod world;

use std::sync::Arc;

use serde_json::json;
use telco_protocol::{ChildOrigin, DeviceType, ErrorCode, Stdio};
use telco_runtime::{Error, Result, TransportParts, memory_pair};

pub use portal::Delivery;

use engine::Shared;
use portal::Role;
use world::{Emit, Fault, ObjectRef, SimApp, SimDevice};

/// Id of the device every simulator starts with.
pub const LOCAL_DEVICE: &str = "local";

impl From<Fault> for Error {
	fn from(fault: Fault) -> Self {
		Error::engine(fault.code, fault.message)
	}
}

/// A simulated engine plus the knobs to drive it.
///
/// Cheap to clone; clones control the same engine.
#[derive(Clone)]
pub struct Simulator {
	shared: Arc<Shared>,
}

impl Default for Simulator {
	fn default() -> Self {
		Self::new()
	}
}

impl Simulator {
	/// A fresh engine with one local device running `init` (pid 1).
	pub fn new() -> Self {
		Self {
			shared: Arc::new(Shared::new()),
		}
	}

	/// Opens a new client connection. Must be called inside a Tokio runtime.
	pub fn connect(&self) -> TransportParts {
		let (client, engine) = memory_pair();
		self.shared.serve(engine);
		client
	}

	pub fn version(&self) -> &'static str {
		engine::VERSION
	}

	/// Drops every client connection, as if the engine had exited.
	pub fn disconnect_all(&self) {
		self.shared.disconnect_all();
	}

	/// References clients currently hold, excluding ones lent to signal callbacks.
	pub fn live_handles(&self) -> usize {
		self.shared.held_handles()
	}

	/// Releases that named a handle the engine did not know (double releases).
	pub fn stale_releases(&self) -> usize {
		self.shared.stale_releases()
	}

	fn apply<T>(&self, f: impl FnOnce(&mut world::World) -> world::Reply<(T, Vec<Emit>)>) -> Result<T> {
		self.shared.apply(f).map_err(Error::from)
	}

	/// Plugs a device in. Open managers see `added` then `changed`.
	pub fn add_device(&self, id: &str, name: &str, kind: DeviceType) -> Result<()> {
		self.apply(|world| {
			if world.devices.get(id).is_some_and(|d| !d.lost) {
				return Err(Fault::invalid_argument(format!("device {id:?} already exists")));
			}
			Ok(((), world.add_device(SimDevice::new(id, name, kind))))
		})
	}

	/// Unplugs a device: its wrappers see `lost`, managers `removed` and `changed`.
	pub fn remove_device(&self, id: &str) -> Result<()> {
		self.apply(|world| {
			let emits = world
				.remove_device(id)
				.ok_or_else(|| Fault::new(ErrorCode::NotFound, format!("device {id:?} not found")))?;
			Ok(((), emits))
		})
	}

	/// Adds a running process with a fixed pid.
	pub fn add_process(&self, device: &str, pid: u32, name: &str) -> Result<()> {
		self.apply(|world| {
			let dev = world.device_mut(device)?;
			if dev.processes.contains_key(&pid) {
				return Err(Fault::invalid_argument(format!("pid {pid} is taken")));
			}
			dev.add_process(pid, name, Stdio::Inherit, false);
			Ok(((), Vec::new()))
		})
	}

	/// Installs an application; `pid` 0 means not running. A non-zero pid
	/// also starts the process if it is not there yet.
	pub fn add_application(&self, device: &str, identifier: &str, name: &str, pid: u32) -> Result<()> {
		self.apply(|world| {
			let dev = world.device_mut(device)?;
			if pid != 0 && !dev.processes.contains_key(&pid) {
				dev.add_process(pid, name, Stdio::Inherit, false);
			}
			dev.applications.retain(|a| a.identifier != identifier);
			dev.applications.push(SimApp {
				identifier: identifier.to_string(),
				name: name.to_string(),
				pid,
			});
			Ok(((), Vec::new()))
		})
	}

	/// Makes an installed application the frontmost one.
	pub fn set_frontmost(&self, device: &str, identifier: Option<&str>) -> Result<()> {
		self.apply(|world| {
			let dev = world.device_mut(device)?;
			if let Some(identifier) = identifier {
				if !dev.applications.iter().any(|a| a.identifier == identifier) {
					return Err(Fault::invalid_argument(format!("no application {identifier:?}")));
				}
			}
			dev.frontmost = identifier.map(str::to_string);
			Ok(((), Vec::new()))
		})
	}

	/// Something outside the client starts `name`. With spawn gating on it is
	/// held and reported through `spawn_added`.
	pub fn launch_process(&self, device: &str, name: &str) -> Result<u32> {
		self.apply(|world| world.launch(device, name))
	}

	/// Kills `pid` with a crash report; sessions detach with it.
	pub fn crash_process(&self, device: &str, pid: u32, summary: &str) -> Result<()> {
		self.apply(|world| Ok(((), world.crash(device, pid, summary)?)))
	}

	/// `parent` forks. Held and reported through `child_added` when a session
	/// on the parent has child gating on.
	pub fn fork_child(&self, device: &str, parent: u32, origin: ChildOrigin) -> Result<u32> {
		self.apply(|world| world.fork(device, parent, origin))
	}

	/// Unloads an injected library, reporting `uninjected`.
	pub fn finish_injection(&self, device: &str, id: u32) -> Result<()> {
		self.apply(|world| {
			if !world.device_mut(device)?.injections.remove(&id) {
				return Err(Fault::invalid_argument(format!("no injection {id}")));
			}
			let emit = Emit::to(ObjectRef::Device(device.to_string()), "uninjected", json!({ "id": id }));
			Ok(((), vec![emit]))
		})
	}

	/// Makes the next request named `method`, on any object, fail with
	/// `code`. Later calls behave normally again.
	pub fn fail_next(&self, method: &str, code: ErrorCode, message: &str) {
		let _ = self.apply(|world| {
			world.failures.insert(method.to_string(), Fault::new(code, message));
			Ok(((), Vec::new()))
		});
	}

	/// Diagnostics every later build of `entrypoint` reports.
	pub fn set_diagnostics<I, S>(&self, entrypoint: &str, diagnostics: I)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let diagnostics: Vec<String> = diagnostics.into_iter().map(Into::into).collect();
		let _ = self.apply(|world| {
			world.diagnostics.insert(entrypoint.to_string(), diagnostics);
			Ok(((), Vec::new()))
		});
	}

	/// Edits `entrypoint` on disk: every compiler watching it rebuilds.
	pub fn touch(&self, entrypoint: &str) {
		let _ = self.apply(|world| {
			let mut watchers: Vec<u64> = world
				.compilers
				.iter()
				.filter(|(_, watched)| watched.iter().any(|e| e == entrypoint))
				.map(|(id, _)| *id)
				.collect();
			watchers.sort_unstable();

			let mut emits = Vec::new();
			for id in watchers {
				emits.push(Emit::to(ObjectRef::Compiler(id), "file_changed", json!({})));
				engine::build(world, id, entrypoint, true, &mut emits);
			}
			Ok(((), emits))
		});
	}

	/// A cluster node connects to the portal listening on `port`.
	pub fn portal_connect_node(&self, port: u16, address: &str) -> Result<u32> {
		self.apply(|world| {
			let portal = world.portal_on_port(port).map(|(id, _)| id).ok_or_else(|| not_listening(port))?;
			world.portal_connect(portal, Role::Node, address)
		})
	}

	/// A controller connects to the portal's control endpoint on `port`.
	pub fn portal_connect_controller(&self, port: u16, address: &str) -> Result<u32> {
		self.apply(|world| {
			let portal = world
				.portal_on_control_port(port)
				.map(|(id, _)| id)
				.ok_or_else(|| not_listening(port))?;
			world.portal_connect(portal, Role::Controller, address)
		})
	}

	/// A controller presents a token and is authenticated with `session_info`.
	pub fn portal_authenticate(&self, port: u16, connection_id: u32, session_info: serde_json::Value) -> Result<()> {
		self.portal_event(port, connection_id, "authenticated", json!({ "session_info": session_info }))
	}

	/// A controller subscribes to broadcasts.
	pub fn portal_subscribe(&self, port: u16, connection_id: u32) -> Result<()> {
		self.portal_event(port, connection_id, "subscribe", json!({}))
	}

	/// A controller sends the portal a message.
	pub fn portal_message(&self, port: u16, connection_id: u32, json: &str, data: Option<&[u8]>) -> Result<()> {
		let data = data.map(telco_protocol::buffer::encode);
		self.portal_event(port, connection_id, "message", json!({ "json": json, "data": data }))
	}

	/// A portal peer goes away.
	pub fn portal_disconnect(&self, port: u16, connection_id: u32) -> Result<()> {
		self.apply(|world| {
			let portal = portal_id(world, port)?;
			Ok(((), world.portal_disconnect(portal, connection_id)))
		})
	}

	/// Messages the portal on `port` has handed to its peers so far, in order.
	pub fn delivered(&self, port: u16) -> Vec<Delivery> {
		let world = self.shared.world.lock();
		world
			.portals
			.values()
			.filter(|p| p.cluster.port == port || p.control_port() == port)
			.flat_map(|p| p.delivered.iter().cloned())
			.collect()
	}

	fn portal_event(&self, port: u16, connection_id: u32, signal: &'static str, mut params: serde_json::Value) -> Result<()> {
		self.apply(|world| {
			let portal = portal_id(world, port)?;
			let known = world.portals.get(&portal).and_then(|p| p.connection(connection_id)).is_some();
			if !known {
				return Err(Fault::invalid_argument(format!("no connection {connection_id}")));
			}
			params["connection_id"] = json!(connection_id);
			Ok(((), vec![Emit::to(ObjectRef::Portal(portal), signal, params)]))
		})
	}
}

fn portal_id(world: &mut world::World, port: u16) -> world::Reply<u64> {
	if let Some((id, _)) = world.portal_on_port(port) {
		return Ok(id);
	}
	world.portal_on_control_port(port).map(|(id, _)| id).ok_or_else(|| not_listening(port))
}

fn not_listening(port: u16) -> Fault {
	Fault::new(ErrorCode::ServerNotRunning, format!("no portal listening on port {port}"))
}

impl std::fmt::Debug for Simulator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Simulator")
			.field("live_handles", &self.live_handles())
			.field("stale_releases", &self.stale_releases())
			.finish()
	}
}

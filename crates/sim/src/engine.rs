//! Per-client protocol handling: handle tables, request dispatch, signal fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use telco_protocol::{
	ApplicationDescriptor, ApplicationQueryOptions, DeviceType, EndpointParameters, ErrorCode, FrontmostQueryOptions,
	HandleId, MembershipDescriptor, NIL_HANDLE, ProcessMatchOptions, ProcessQueryOptions, Scope, SessionDescriptor,
	SessionDetachReason, SessionOptions, SpawnOptions, Stdio, buffer,
};
use telco_runtime::{
	CLOSE, CONNECT, DISCONNECT, ErrorPayload, Event, Inbound, Notification, Request, Response, TransportParts, UNREF,
};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::portal::{Role, SimPortal};
use crate::world::{
	Audience, Emit, Fault, ObjectRef, Reply, SimDevice, SimMembership, SimScript, SimSession, SimStream, World,
};

/// Version string reported to clients.
pub(crate) const VERSION: &str = "17.0.0-sim";

/// Magic prefix of compiled script bytecode.
const BYTECODE_MAGIC: &[u8] = b"TCB1";
const SNAPSHOT_MAGIC: &[u8] = b"TSN1";

struct Entry {
	object: ObjectRef,
	/// Lent for one signal delivery; never counted as held.
	borrowed: bool,
}

/// Handles one client holds, plus its signal subscriptions.
#[derive(Default)]
struct HandleTable {
	last: HandleId,
	entries: HashMap<HandleId, Entry>,
	connected: HashMap<HandleId, HashMap<String, usize>>,
}

impl HandleTable {
	fn insert(&mut self, object: ObjectRef, borrowed: bool) -> HandleId {
		self.last += 1;
		self.entries.insert(self.last, Entry { object, borrowed });
		self.last
	}

	fn remove(&mut self, handle: HandleId) -> Option<Entry> {
		self.connected.remove(&handle);
		self.entries.remove(&handle)
	}

	fn connect(&mut self, handle: HandleId, signal: String) {
		*self.connected.entry(handle).or_default().entry(signal).or_default() += 1;
	}

	fn disconnect(&mut self, handle: HandleId, signal: &str) {
		if let Some(signals) = self.connected.get_mut(&handle) {
			if let Some(count) = signals.get_mut(signal) {
				*count = count.saturating_sub(1);
				if *count == 0 {
					signals.remove(signal);
				}
			}
		}
	}

	fn is_connected(&self, handle: HandleId, signal: &str) -> bool {
		self.connected
			.get(&handle)
			.and_then(|signals| signals.get(signal))
			.is_some_and(|count| *count > 0)
	}

	fn held(&self) -> usize {
		self.entries.values().filter(|e| !e.borrowed).count()
	}
}

pub(crate) struct Client {
	/// Taken on hang-up, which ends the writer and with it the transport.
	out: Mutex<Option<mpsc::UnboundedSender<Value>>>,
	table: Mutex<HandleTable>,
}

impl Client {
	fn send<T: Serialize>(&self, message: &T) {
		let value = match serde_json::to_value(message) {
			Ok(value) => value,
			Err(e) => {
				warn!("failed to encode message: {e}");
				return;
			}
		};
		let sent = self.out.lock().as_ref().is_some_and(|out| out.send(value).is_ok());
		if !sent {
			trace!("client gone, message dropped");
		}
	}

	fn hang_up(&self) {
		self.out.lock().take();
	}

	fn respond(&self, id: u32, reply: Reply) {
		let response = match reply {
			Ok(result) => Response {
				id,
				result: Some(result),
				error: None,
			},
			Err(fault) => {
				debug!(id, code = %fault.code, message = %fault.message, "request failed");
				Response {
					id,
					result: None,
					error: Some(ErrorPayload {
						code: fault.code,
						message: fault.message,
					}),
				}
			}
		};
		self.send(&response);
	}

	fn alloc(&self, object: ObjectRef) -> HandleId {
		self.table.lock().insert(object, false)
	}

	fn object(&self, handle: HandleId) -> Option<ObjectRef> {
		self.table.lock().entries.get(&handle).map(|e| e.object.clone())
	}
}

/// State shared by every client of one simulator.
pub(crate) struct Shared {
	pub world: Mutex<World>,
	clients: Mutex<Vec<Arc<Client>>>,
	changed: Notify,
	stale_releases: AtomicUsize,
}

impl Shared {
	pub fn new() -> Self {
		Self {
			world: Mutex::new(World::new()),
			clients: Mutex::new(Vec::new()),
			changed: Notify::new(),
			stale_releases: AtomicUsize::new(0),
		}
	}

	/// Serves one client over the engine end of a transport pair.
	pub fn serve(self: &Arc<Self>, parts: TransportParts) {
		let TransportParts {
			mut sender,
			receiver,
			mut message_rx,
		} = parts;
		let (out, mut out_rx) = mpsc::unbounded_channel::<Value>();
		let client = Arc::new(Client {
			out: Mutex::new(Some(out)),
			table: Mutex::new(HandleTable::default()),
		});
		self.clients.lock().push(Arc::clone(&client));

		tokio::spawn(async move {
			if let Err(e) = receiver.run().await {
				debug!("engine-side transport reader stopped: {e}");
			}
		});
		tokio::spawn(async move {
			while let Some(message) = out_rx.recv().await {
				if sender.send(message).await.is_err() {
					break;
				}
			}
		});

		let shared = Arc::clone(self);
		tokio::spawn(async move {
			while let Some(value) = message_rx.recv().await {
				match serde_json::from_value::<Inbound>(value) {
					Ok(Inbound::Request(request)) => shared.on_request(&client, request),
					Ok(Inbound::Notification(notification)) => shared.on_notification(&client, notification),
					Err(e) => warn!("malformed client message: {e}"),
				}
			}
			debug!("client went away");
			shared.drop_client(&client);
		});
	}

	fn drop_client(&self, client: &Arc<Client>) {
		self.clients.lock().retain(|c| !Arc::ptr_eq(c, client));
	}

	/// Hangs up on every client.
	pub fn disconnect_all(&self) {
		for client in self.clients.lock().drain(..) {
			client.hang_up();
		}
	}

	pub fn held_handles(&self) -> usize {
		self.clients.lock().iter().map(|c| c.table.lock().held()).sum()
	}

	pub fn stale_releases(&self) -> usize {
		self.stale_releases.load(Ordering::Relaxed)
	}

	/// Runs a mutation against the world and publishes what it emitted.
	pub fn apply<T>(&self, f: impl FnOnce(&mut World) -> Reply<(T, Vec<Emit>)>) -> Reply<T> {
		let result = {
			let mut world = self.world.lock();
			let result = f(&mut world);
			result.map(|(value, emits)| {
				self.publish(&world, emits);
				value
			})
		};
		self.changed.notify_waiters();
		result
	}

	fn on_request(self: &Arc<Self>, client: &Arc<Client>, request: Request) {
		trace!(id = request.id, handle = request.handle, method = %request.method, "request");
		let mut world = self.world.lock();
		let mut call = Call {
			client,
			world: &mut *world,
			emits: Vec::new(),
		};
		let outcome = call.dispatch(request.handle, &request.method, request.params);
		let emits = std::mem::take(&mut call.emits);

		match outcome {
			Outcome::Done(reply) => client.respond(request.id, reply),
			Outcome::Wait { probe, timeout } => {
				let shared = Arc::clone(self);
				let client = Arc::clone(client);
				tokio::spawn(async move { shared.wait(client, request.id, probe, timeout).await });
			}
		}
		self.publish(&world, emits);
		drop(world);
		self.changed.notify_waiters();
	}

	fn on_notification(&self, client: &Client, notification: Notification) {
		let Notification { handle, method, params } = notification;
		trace!(handle, %method, "notification");
		let mut table = client.table.lock();
		match method.as_str() {
			UNREF | CLOSE => {
				match table.remove(handle) {
					Some(entry) => {
						if let ObjectRef::Stream(id) = entry.object {
							drop(table);
							if let Some(stream) = self.world.lock().streams.get_mut(&id) {
								stream.closed = true;
							}
						}
					}
					None => {
						warn!(handle, %method, "release of unknown handle");
						self.stale_releases.fetch_add(1, Ordering::Relaxed);
					}
				}
			}
			CONNECT | DISCONNECT => {
				let Some(signal) = params.get("signal").and_then(Value::as_str) else {
					warn!(handle, %method, "subscription without a signal name");
					return;
				};
				if method == CONNECT {
					table.connect(handle, signal.to_string());
				} else {
					table.disconnect(handle, signal);
				}
			}
			other => warn!(handle, method = other, "unknown notification"),
		}
	}

	/// Delivers each emit to every client handle subscribed to it, lending
	/// fresh handles for the objects inside the payload.
	fn publish(&self, world: &World, emits: Vec<Emit>) {
		if emits.is_empty() {
			return;
		}
		let clients = self.clients.lock();
		for emit in &emits {
			for client in clients.iter() {
				let mut table = client.table.lock();
				let mut targets: Vec<HandleId> = table
					.entries
					.iter()
					.filter(|(_, entry)| match &emit.audience {
						Audience::Managers => match entry.object {
							ObjectRef::Manager(id) => world.managers.get(&id).is_some_and(|closed| !closed),
							_ => false,
						},
						Audience::Object(object) => entry.object == *object,
					})
					.map(|(handle, _)| *handle)
					.filter(|handle| table.is_connected(*handle, emit.signal))
					.collect();
				targets.sort_unstable();

				for handle in targets {
					let mut params = emit.params.clone();
					for (pointer, object) in &emit.borrow {
						let lent = table.insert(object.clone(), true);
						if let Some(slot) = params.pointer_mut(pointer).and_then(Value::as_object_mut) {
							slot.insert("handle".into(), json!(lent));
						}
					}
					client.send(&Event {
						handle,
						signal: emit.signal.to_string(),
						params,
					});
				}
			}
		}
	}

	async fn wait(&self, client: Arc<Client>, id: u32, probe: Probe, timeout: Duration) {
		let deadline = Instant::now() + timeout;
		let reply = loop {
			let notified = self.changed.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			let found = {
				let mut world = self.world.lock();
				let mut call = Call {
					client: &client,
					world: &mut *world,
					emits: Vec::new(),
				};
				call.probe(&probe)
			};
			if let Some(reply) = found {
				break reply;
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				break Err(Fault::new(ErrorCode::TimedOut, probe.timeout_message()));
			}
		};
		client.respond(id, reply);
	}
}

/// Condition a `find_*` request waits for.
enum Probe {
	DeviceById { manager: u64, id: String },
	DeviceByType { manager: u64, kind: DeviceType },
	ProcessByPid { device: String, pid: u32, scope: Scope },
	ProcessByName { device: String, name: String, scope: Scope },
}

impl Probe {
	fn timeout_message(&self) -> String {
		match self {
			Self::DeviceById { id, .. } => format!("timed out waiting for device {id:?}"),
			Self::DeviceByType { kind, .. } => format!("timed out waiting for a {kind:?} device"),
			Self::ProcessByPid { pid, .. } => format!("timed out waiting for process with pid {pid}"),
			Self::ProcessByName { name, .. } => format!("timed out waiting for process {name:?}"),
		}
	}
}

enum Outcome {
	Done(Reply),
	Wait { probe: Probe, timeout: Duration },
}

impl From<Reply> for Outcome {
	fn from(reply: Reply) -> Self {
		Self::Done(reply)
	}
}

/// One request being served with the world locked.
struct Call<'a> {
	client: &'a Client,
	world: &'a mut World,
	emits: Vec<Emit>,
}

impl Call<'_> {
	fn dispatch(&mut self, handle: HandleId, method: &str, params: Value) -> Outcome {
		if let Some(fault) = self.world.failures.remove(method) {
			return Outcome::Done(Err(fault));
		}
		if handle == NIL_HANDLE {
			return self.root(method, params).into();
		}
		let Some(object) = self.client.object(handle) else {
			return Outcome::Done(Err(Fault::invalid_argument(format!("invalid handle {handle}"))));
		};
		match object {
			ObjectRef::Manager(id) => self.manager(id, method, params),
			ObjectRef::Device(id) => self.device(&id, method, params),
			ObjectRef::Session(id) => self.session(id, method, params).into(),
			ObjectRef::Script(id) => self.script(id, method, params).into(),
			ObjectRef::Compiler(id) => self.compiler(id, method, params).into(),
			ObjectRef::Portal(id) => self.portal(id, method, params).into(),
			ObjectRef::Membership(id) => self.membership(id, method).into(),
			ObjectRef::Stream(id) => self.stream(handle, id, method, params).into(),
			other => Outcome::Done(Err(no_method(other.kind(), method))),
		}
	}

	fn root(&mut self, method: &str, params: Value) -> Reply {
		match method {
			"version" => Ok(json!(VERSION)),
			"device_manager.new" => {
				let id = self.world.next_id();
				self.world.managers.insert(id, false);
				Ok(self.handle_ref(ObjectRef::Manager(id)))
			}
			"compiler.new" => {
				let id = self.world.next_id();
				self.world.compilers.insert(id, Vec::new());
				Ok(self.handle_ref(ObjectRef::Compiler(id)))
			}
			"portal.new" => {
				let cluster: EndpointParameters = arg(&params, "cluster")?;
				let control: Option<EndpointParameters> = arg(&params, "control")?;
				let id = self.world.next_id();
				let device_id = format!("portal-{}", cluster.port);
				let mut device = SimDevice::new(&device_id, "Portal", DeviceType::Local);
				device.hidden = true;
				self.world.devices.insert(device_id.clone(), device);
				self.world.portals.insert(id, SimPortal::new(cluster, control, device_id));
				Ok(self.handle_ref(ObjectRef::Portal(id)))
			}
			other => Err(no_method("root", other)),
		}
	}

	fn manager(&mut self, id: u64, method: &str, params: Value) -> Outcome {
		if self.world.managers.get(&id).copied().unwrap_or(true) {
			return Outcome::Done(Err(Fault::invalid_operation("device manager is closed")));
		}
		match method {
			"enumerate_devices" => {
				let descs: Vec<_> = self.world.visible_devices().map(|d| d.desc.clone()).collect();
				let items: Vec<_> = descs
					.into_iter()
					.map(|mut desc| {
						desc.handle = self.client.alloc(ObjectRef::Device(desc.id.clone()));
						desc
					})
					.collect();
				Outcome::Done(Ok(self.list(items)))
			}
			"get_device_by_id" => {
				self.manager_get(arg(&params, "id").map(|device| Probe::DeviceById { manager: id, id: device }))
			}
			"get_device_by_type" => {
				self.manager_get(arg(&params, "type").map(|kind| Probe::DeviceByType { manager: id, kind }))
			}
			"find_device_by_id" | "find_device_by_type" => {
				let probe = if method == "find_device_by_id" {
					arg(&params, "id").map(|device| Probe::DeviceById { manager: id, id: device })
				} else {
					arg(&params, "type").map(|kind| Probe::DeviceByType { manager: id, kind })
				};
				let timeout = arg::<Option<u64>>(&params, "timeout").map(|t| t.unwrap_or(10_000));
				match (probe, timeout) {
					(Ok(probe), Ok(timeout)) => match self.probe(&probe) {
						Some(reply) => Outcome::Done(reply),
						None => Outcome::Wait {
							probe,
							timeout: Duration::from_millis(timeout),
						},
					},
					(Err(fault), _) | (_, Err(fault)) => Outcome::Done(Err(fault)),
				}
			}
			"add_remote_device" => self.add_remote_device(&params).into(),
			"remove_remote_device" => {
				let result = arg::<String>(&params, "address").and_then(|address| {
					let emits = self
						.world
						.remove_device(&remote_id(&address))
						.ok_or_else(|| Fault::invalid_argument(format!("no remote device at {address}")))?;
					self.emits.extend(emits);
					Ok(Value::Null)
				});
				result.into()
			}
			"close" => {
				self.world.managers.insert(id, true);
				Outcome::Done(Ok(Value::Null))
			}
			other => Outcome::Done(Err(no_method("device manager", other))),
		}
	}

	/// `get_*` lookups: answer now or fail with not-found.
	fn manager_get(&mut self, probe: Reply<Probe>) -> Outcome {
		let reply = probe.and_then(|probe| {
			self.probe(&probe).unwrap_or_else(|| {
				Err(Fault::new(
					ErrorCode::NotFound,
					match &probe {
						Probe::DeviceById { id, .. } => format!("device {id:?} not found"),
						Probe::DeviceByType { kind, .. } => format!("no {kind:?} device found"),
						_ => "not found".to_string(),
					},
				))
			})
		});
		Outcome::Done(reply)
	}

	fn add_remote_device(&mut self, params: &Value) -> Reply {
		let address: String = arg(params, "address")?;
		if address.is_empty() {
			return Err(Fault::invalid_argument("address must not be empty"));
		}
		let id = remote_id(&address);
		let exists = self.world.devices.get(&id).is_some_and(|d| !d.lost);
		if !exists {
			let emits = self
				.world
				.add_device(SimDevice::new(&id, &format!("Remote ({address})"), DeviceType::Remote));
			self.emits.extend(emits);
		}
		let mut desc = self.world.device(&id)?.desc.clone();
		desc.handle = self.client.alloc(ObjectRef::Device(id));
		Ok(json!(desc))
	}

	fn probe(&mut self, probe: &Probe) -> Option<Reply> {
		match probe {
			Probe::DeviceById { manager, id } => {
				if self.world.managers.get(manager).copied().unwrap_or(true) {
					return Some(Err(Fault::invalid_operation("device manager is closed")));
				}
				let mut desc = self.world.visible_devices().find(|d| d.id() == id)?.desc.clone();
				desc.handle = self.client.alloc(ObjectRef::Device(desc.id.clone()));
				Some(Ok(json!(desc)))
			}
			Probe::DeviceByType { manager, kind } => {
				if self.world.managers.get(manager).copied().unwrap_or(true) {
					return Some(Err(Fault::invalid_operation("device manager is closed")));
				}
				let mut desc = self.world.visible_devices().find(|d| d.desc.kind == *kind)?.desc.clone();
				desc.handle = self.client.alloc(ObjectRef::Device(desc.id.clone()));
				Some(Ok(json!(desc)))
			}
			Probe::ProcessByPid { device, pid, scope } => {
				let dev = match self.world.device(device) {
					Ok(dev) => dev,
					Err(fault) => return Some(Err(fault)),
				};
				let desc = dev.process_descriptor(*pid, *scope)?;
				Some(Ok(self.process(device, desc)))
			}
			Probe::ProcessByName { device, name, scope } => {
				let dev = match self.world.device(device) {
					Ok(dev) => dev,
					Err(fault) => return Some(Err(fault)),
				};
				let desc = dev.process_descriptor(dev.pid_by_name(name)?, *scope)?;
				Some(Ok(self.process(device, desc)))
			}
		}
	}

	fn device(&mut self, id: &str, method: &str, params: Value) -> Outcome {
		match method {
			"is_lost" => {
				let lost = self.world.devices.get(id).is_none_or(|d| d.lost);
				return Outcome::Done(Ok(json!(lost)));
			}
			"get_process_by_pid" | "get_process_by_name" | "find_process_by_pid" | "find_process_by_name" => {
				return self.process_lookup(id, method, &params);
			}
			_ => {}
		}
		if let Err(fault) = self.world.device(id) {
			return Outcome::Done(Err(fault));
		}
		self.device_call(id, method, &params).into()
	}

	fn process_lookup(&mut self, device: &str, method: &str, params: &Value) -> Outcome {
		let options: ProcessMatchOptions = match opt(params, "options") {
			Ok(options) => options,
			Err(fault) => return Outcome::Done(Err(fault)),
		};
		let probe = if method.ends_with("_by_pid") {
			arg(params, "pid").map(|pid| Probe::ProcessByPid {
				device: device.to_string(),
				pid,
				scope: options.scope,
			})
		} else {
			arg(params, "name").map(|name| Probe::ProcessByName {
				device: device.to_string(),
				name,
				scope: options.scope,
			})
		};
		let probe = match probe {
			Ok(probe) => probe,
			Err(fault) => return Outcome::Done(Err(fault)),
		};

		if let Some(reply) = self.probe(&probe) {
			return Outcome::Done(reply);
		}
		if method.starts_with("find_") {
			return Outcome::Wait {
				probe,
				timeout: Duration::from_millis(u64::from(options.timeout)),
			};
		}
		Outcome::Done(Err(match probe {
			Probe::ProcessByPid { pid, .. } => Fault::process_not_found(pid),
			Probe::ProcessByName { name, .. } => Fault::new(
				ErrorCode::ProcessNotFound,
				format!("unable to find process with name {name:?}"),
			),
			_ => Fault::new(ErrorCode::NotFound, "not found"),
		}))
	}

	fn device_call(&mut self, id: &str, method: &str, params: &Value) -> Reply {
		match method {
			"get_manager" => {
				let open = self
					.world
					.managers
					.iter()
					.filter(|(_, closed)| !**closed)
					.map(|(id, _)| *id)
					.min();
				let manager = match open {
					Some(manager) => manager,
					None => {
						let manager = self.world.next_id();
						self.world.managers.insert(manager, false);
						manager
					}
				};
				Ok(self.handle_ref(ObjectRef::Manager(manager)))
			}
			"query_system_parameters" => Ok(Value::Object(self.world.device(id)?.system_parameters())),
			"get_frontmost_application" => {
				let options: FrontmostQueryOptions = opt(params, "options")?;
				let dev = self.world.device(id)?;
				let app = dev
					.frontmost
					.as_ref()
					.and_then(|identifier| dev.applications.iter().find(|a| &a.identifier == identifier))
					.filter(|app| app.pid != 0)
					.map(|app| dev.application_descriptor(app, options.scope));
				Ok(match app {
					Some(desc) => self.application(id, desc),
					None => Value::Null,
				})
			}
			"enumerate_applications" => {
				let options: ApplicationQueryOptions = opt(params, "options")?;
				let dev = self.world.device(id)?;
				let descs: Vec<ApplicationDescriptor> = dev
					.applications
					.iter()
					.filter(|app| options.identifiers.is_empty() || options.identifiers.contains(&app.identifier))
					.map(|app| dev.application_descriptor(app, options.scope))
					.collect();
				let items: Vec<Value> = descs.into_iter().map(|desc| self.application(id, desc)).collect();
				Ok(self.list(items))
			}
			"enumerate_processes" => {
				let options: ProcessQueryOptions = opt(params, "options")?;
				let dev = self.world.device(id)?;
				let descs: Vec<_> = dev
					.processes
					.keys()
					.filter(|pid| options.pids.is_empty() || options.pids.contains(pid))
					.filter_map(|pid| dev.process_descriptor(*pid, options.scope))
					.collect();
				let items: Vec<Value> = descs.into_iter().map(|desc| self.process(id, desc)).collect();
				Ok(self.list(items))
			}
			"enable_spawn_gating" | "disable_spawn_gating" => {
				self.world.device_mut(id)?.spawn_gating = method == "enable_spawn_gating";
				Ok(Value::Null)
			}
			"enumerate_pending_spawn" => {
				let pending = self.world.device(id)?.pending_spawn.clone();
				let items: Vec<_> = pending
					.into_iter()
					.map(|mut spawn| {
						spawn.handle = self.client.alloc(ObjectRef::Spawn {
							device: id.to_string(),
							pid: spawn.pid,
						});
						spawn
					})
					.collect();
				Ok(self.list(items))
			}
			"enumerate_pending_children" => {
				let pending = self.world.device(id)?.pending_children.clone();
				let items: Vec<_> = pending
					.into_iter()
					.map(|mut child| {
						child.handle = self.client.alloc(ObjectRef::Child {
							device: id.to_string(),
							pid: child.pid,
						});
						child
					})
					.collect();
				Ok(self.list(items))
			}
			"spawn" => {
				let program: String = arg(params, "program")?;
				let options: SpawnOptions = opt(params, "options")?;
				if program.is_empty() {
					return Err(Fault::invalid_argument("program must not be empty"));
				}
				let name = program.rsplit('/').next().unwrap_or(&program).to_string();
				let dev = self.world.device_mut(id)?;
				let pid = dev.allocate_pid();
				dev.add_process(pid, &name, options.stdio, true);
				if let Some(process) = dev.processes.get_mut(&pid) {
					process.path = program;
				}
				debug!(device = id, pid, %name, "spawned");
				Ok(json!(pid))
			}
			"input" => {
				let pid: u32 = arg(params, "pid")?;
				let data = bytes(params, "data")?;
				let dev = self.world.device(id)?;
				let process = dev.processes.get(&pid).ok_or_else(|| Fault::process_not_found(pid))?;
				if process.stdio != Stdio::Pipe {
					return Err(Fault::invalid_operation("process was not spawned with piped stdio"));
				}
				self.emits.push(Emit::to(
					ObjectRef::Device(id.to_string()),
					"output",
					json!({ "pid": pid, "fd": 1, "data": buffer::encode(&data) }),
				));
				Ok(Value::Null)
			}
			"resume" => {
				let pid: u32 = arg(params, "pid")?;
				let dev = self.world.device_mut(id)?;
				let process = dev.processes.get_mut(&pid).ok_or_else(|| Fault::process_not_found(pid))?;
				process.suspended = false;

				let spawns: Vec<_> = dev.pending_spawn.iter().filter(|s| s.pid == pid).cloned().collect();
				let children: Vec<_> = dev.pending_children.iter().filter(|c| c.pid == pid).cloned().collect();
				dev.pending_spawn.retain(|s| s.pid != pid);
				dev.pending_children.retain(|c| c.pid != pid);
				for spawn in spawns {
					self.emits.push(
						Emit::to(ObjectRef::Device(id.to_string()), "spawn_removed", json!({ "spawn": spawn }))
							.borrowing("/spawn", ObjectRef::Spawn { device: id.to_string(), pid }),
					);
				}
				for child in children {
					self.emits.push(
						Emit::to(ObjectRef::Device(id.to_string()), "child_removed", json!({ "child": child }))
							.borrowing("/child", ObjectRef::Child { device: id.to_string(), pid }),
					);
				}
				Ok(Value::Null)
			}
			"kill" => {
				let pid: u32 = arg(params, "pid")?;
				let emits = self.world.end_process(id, pid, SessionDetachReason::ProcessTerminated)?;
				self.emits.extend(emits);
				Ok(Value::Null)
			}
			"attach" => {
				let pid: u32 = arg(params, "pid")?;
				let options: SessionOptions = opt(params, "options")?;
				if !self.world.device(id)?.processes.contains_key(&pid) {
					return Err(Fault::process_not_found(pid));
				}
				let session = self.world.next_id();
				self.world.sessions.insert(
					session,
					SimSession {
						device: id.to_string(),
						pid,
						persist_timeout: options.persist_timeout,
						detached: false,
						child_gating: false,
						peer: false,
					},
				);
				let desc = SessionDescriptor {
					handle: self.client.alloc(ObjectRef::Session(session)),
					pid,
					persist_timeout: options.persist_timeout,
				};
				Ok(json!(desc))
			}
			"inject_library_file" | "inject_library_blob" => {
				let pid: u32 = arg(params, "pid")?;
				if method == "inject_library_file" {
					let path: String = arg(params, "path")?;
					if path.is_empty() {
						return Err(Fault::invalid_argument("library path must not be empty"));
					}
				} else if bytes(params, "blob")?.is_empty() {
					return Err(Fault::invalid_argument("library blob must not be empty"));
				}
				let dev = self.world.device_mut(id)?;
				if !dev.processes.contains_key(&pid) {
					return Err(Fault::process_not_found(pid));
				}
				Ok(json!(dev.allocate_injection()))
			}
			"open_channel" => {
				let address: String = arg(params, "address")?;
				let supported = ["tcp:", "unix:", "dev:"].iter().any(|scheme| address.starts_with(scheme));
				if !supported {
					return Err(Fault::new(
						ErrorCode::NotSupported,
						format!("unsupported channel address {address:?}"),
					));
				}
				let stream = self.world.next_id();
				self.world.streams.insert(stream, SimStream::default());
				Ok(self.handle_ref(ObjectRef::Stream(stream)))
			}
			other => Err(no_method("device", other)),
		}
	}

	fn session(&mut self, id: u64, method: &str, params: Value) -> Reply {
		match method {
			"is_detached" => {
				let detached = self.world.sessions.get(&id).is_none_or(|s| s.detached);
				Ok(json!(detached))
			}
			"detach" => {
				let emits = self
					.world
					.detach_session(id, SessionDetachReason::ApplicationRequested, None);
				self.emits.extend(emits);
				Ok(Value::Null)
			}
			"resume" => {
				self.world.session(id)?;
				Ok(Value::Null)
			}
			"enable_child_gating" | "disable_child_gating" => {
				self.world.session_mut(id)?.child_gating = method == "enable_child_gating";
				Ok(Value::Null)
			}
			"create_script" | "create_script_from_bytes" => {
				self.world.session(id)?;
				if method == "create_script" {
					let source: String = arg(&params, "source")?;
					check_syntax(&source)?;
				} else {
					let code = bytes(&params, "bytes")?;
					if !code.starts_with(BYTECODE_MAGIC) {
						return Err(Fault::invalid_argument("not a compiled script"));
					}
				}
				let script = self.world.next_id();
				self.world.scripts.insert(
					script,
					SimScript {
						session: id,
						..SimScript::default()
					},
				);
				Ok(self.handle_ref(ObjectRef::Script(script)))
			}
			"compile_script" => {
				self.world.session(id)?;
				let source: String = arg(&params, "source")?;
				check_syntax(&source)?;
				let mut code = BYTECODE_MAGIC.to_vec();
				code.extend_from_slice(source.as_bytes());
				Ok(json!({ "bytes": buffer::encode(&code) }))
			}
			"snapshot_script" => {
				self.world.session(id)?;
				let embed: String = arg(&params, "embed_script")?;
				check_syntax(&embed)?;
				let mut snapshot = SNAPSHOT_MAGIC.to_vec();
				snapshot.extend_from_slice(embed.as_bytes());
				Ok(json!({ "bytes": buffer::encode(&snapshot) }))
			}
			"setup_peer_connection" => {
				self.world.session_mut(id)?.peer = true;
				Ok(Value::Null)
			}
			"join_portal" => self.join_portal(id, &params),
			other => Err(no_method("session", other)),
		}
	}

	fn join_portal(&mut self, session: u64, params: &Value) -> Reply {
		let address: String = arg(params, "address")?;
		let (device, pid) = {
			let s = self.world.session(session)?;
			(s.device.clone(), s.pid)
		};
		let port = address
			.rsplit(':')
			.next()
			.and_then(|p| p.parse::<u16>().ok())
			.ok_or_else(|| Fault::invalid_argument(format!("invalid portal address {address:?}")))?;
		let portal = self
			.world
			.portal_on_port(port)
			.map(|(id, _)| id)
			.ok_or_else(|| Fault::new(ErrorCode::ServerNotRunning, format!("no portal listening on {address}")))?;

		let name = self
			.world
			.device(&device)?
			.processes
			.get(&pid)
			.map(|p| p.name.clone())
			.ok_or_else(|| Fault::process_not_found(pid))?;
		let application = ApplicationDescriptor {
			handle: NIL_HANDLE,
			identifier: name.clone(),
			name,
			pid,
			parameters: Default::default(),
		};

		let (connection, emits) = self
			.world
			.portal_connect(portal, Role::Node, &format!("{device}:{pid}"))?;
		self.emits.extend(emits);
		if let Some(conn) = self.world.portals.get_mut(&portal).and_then(|p| p.connection_mut(connection)) {
			conn.application = Some(application.clone());
		}
		let portal_device = self.world.portals.get(&portal).map(|p| p.device_id.clone()).unwrap_or_default();
		self.emits.push(
			Emit::to(
				ObjectRef::Portal(portal),
				"node_joined",
				json!({ "connection_id": connection, "application": application }),
			)
			.borrowing(
				"/application",
				ObjectRef::Application {
					device: portal_device,
					identifier: application.identifier.clone(),
				},
			),
		);

		let membership = self.world.next_id();
		self.world.memberships.insert(
			membership,
			SimMembership {
				portal,
				connection,
				terminated: false,
			},
		);
		let desc = MembershipDescriptor {
			handle: self.client.alloc(ObjectRef::Membership(membership)),
			id: connection,
		};
		Ok(json!(desc))
	}

	fn script(&mut self, id: u64, method: &str, params: Value) -> Reply {
		let script = self
			.world
			.scripts
			.get_mut(&id)
			.ok_or_else(|| Fault::invalid_argument(format!("no script {id}")))?;
		if method == "is_destroyed" {
			return Ok(json!(script.destroyed));
		}
		if script.destroyed {
			return Err(Fault::invalid_operation("script is destroyed"));
		}
		match method {
			"load" => {
				if script.loaded {
					return Err(Fault::invalid_operation("script is already loaded"));
				}
				script.loaded = true;
				Ok(Value::Null)
			}
			"unload" => {
				script.destroyed = true;
				self.emits.push(Emit::to(ObjectRef::Script(id), "destroyed", json!({})));
				Ok(Value::Null)
			}
			"eternalize" => {
				if !script.loaded {
					return Err(Fault::invalid_operation("script is not loaded"));
				}
				script.eternal = true;
				Ok(Value::Null)
			}
			"post" => {
				if !script.loaded {
					return Err(Fault::invalid_operation("script is not loaded"));
				}
				let payload = match params.get("json").and_then(Value::as_str) {
					Some(text) => serde_json::from_str::<Value>(text)
						.map_err(|e| Fault::invalid_argument(format!("malformed message: {e}")))?,
					None => Value::Null,
				};
				let data = params.get("data").cloned().unwrap_or(Value::Null);
				let message = json!({ "type": "send", "payload": payload }).to_string();
				self.emits.push(Emit::to(
					ObjectRef::Script(id),
					"message",
					json!({ "message": message, "data": data }),
				));
				Ok(Value::Null)
			}
			other => Err(no_method("script", other)),
		}
	}

	fn compiler(&mut self, id: u64, method: &str, params: Value) -> Reply {
		if !self.world.compilers.contains_key(&id) {
			return Err(Fault::invalid_argument(format!("no compiler {id}")));
		}
		let entrypoint: String = arg(&params, "entrypoint")?;
		if entrypoint.is_empty() {
			return Err(Fault::invalid_argument("entrypoint must not be empty"));
		}
		match method {
			"build" => {
				let bundle = build(self.world, id, &entrypoint, false, &mut self.emits);
				Ok(json!({ "bundle": bundle }))
			}
			"watch" => {
				if let Some(watched) = self.world.compilers.get_mut(&id) {
					if !watched.contains(&entrypoint) {
						watched.push(entrypoint.clone());
					}
				}
				build(self.world, id, &entrypoint, true, &mut self.emits);
				Ok(Value::Null)
			}
			other => Err(no_method("compiler", other)),
		}
	}

	fn portal(&mut self, id: u64, method: &str, params: Value) -> Reply {
		if !self.world.portals.contains_key(&id) {
			return Err(Fault::invalid_argument(format!("no portal {id}")));
		}
		match method {
			"get_device" => {
				let device_id = self.world.portals.get(&id).map(|p| p.device_id.clone()).unwrap_or_default();
				let mut desc = self
					.world
					.devices
					.get(&device_id)
					.map(|d| d.desc.clone())
					.ok_or_else(|| Fault::new(ErrorCode::NotFound, "portal device is gone"))?;
				desc.handle = self.client.alloc(ObjectRef::Device(device_id));
				Ok(json!(desc))
			}
			"start" => {
				let (ports, started) = match self.world.portals.get(&id) {
					Some(p) => ([p.cluster.port, p.control_port()], p.started),
					None => return Err(Fault::invalid_argument(format!("no portal {id}"))),
				};
				if started {
					return Err(Fault::invalid_operation("portal is already started"));
				}
				let in_use = self
					.world
					.portals
					.iter()
					.filter(|(other, p)| **other != id && p.started)
					.any(|(_, p)| ports.contains(&p.cluster.port) || ports.contains(&p.control_port()));
				if in_use {
					return Err(Fault::new(
						ErrorCode::AddressInUse,
						format!("address already in use (port {})", ports[0]),
					));
				}
				if let Some(p) = self.world.portals.get_mut(&id) {
					p.started = true;
				}
				Ok(Value::Null)
			}
			"stop" => {
				let emits = self.world.portal_disconnect_all(id);
				self.emits.extend(emits);
				if let Some(p) = self.world.portals.get_mut(&id) {
					p.started = false;
				}
				Ok(Value::Null)
			}
			"kick" => {
				let connection: u32 = arg(&params, "connection_id")?;
				let emits = self.world.portal_disconnect(id, connection);
				self.emits.extend(emits);
				Ok(Value::Null)
			}
			"post" | "narrowcast" | "broadcast" => {
				let json: Option<String> = arg(&params, "json")?;
				let data = match params.get("data") {
					Some(Value::String(_)) => Some(bytes(&params, "data")?),
					_ => None,
				};
				let Some(portal) = self.world.portals.get_mut(&id) else {
					return Err(Fault::invalid_argument(format!("no portal {id}")));
				};
				let targets = match method {
					"post" => {
						let connection: u32 = arg(&params, "connection_id")?;
						portal.connection(connection).map(|_| vec![connection]).unwrap_or_default()
					}
					"narrowcast" => portal.holders(&arg::<String>(&params, "tag")?),
					_ => portal
						.ids()
						.into_iter()
						.filter(|c| portal.connection(*c).is_some_and(|c| c.role == Role::Controller))
						.collect(),
				};
				portal.deliver(&targets, json.as_deref(), data.as_deref());
				Ok(Value::Null)
			}
			"enumerate_tags" => {
				let connection: u32 = arg(&params, "connection_id")?;
				let tags = self.world.portals.get(&id).map(|p| p.tags(connection)).unwrap_or_default();
				Ok(json!(tags))
			}
			"tag" | "untag" => {
				let connection: u32 = arg(&params, "connection_id")?;
				let tag: String = arg(&params, "tag")?;
				if let Some(portal) = self.world.portals.get_mut(&id) {
					if method == "tag" {
						portal.tag(connection, &tag);
					} else {
						portal.untag(connection, &tag);
					}
				}
				Ok(Value::Null)
			}
			other => Err(no_method("portal", other)),
		}
	}

	fn membership(&mut self, id: u64, method: &str) -> Reply {
		if method != "terminate" {
			return Err(no_method("membership", method));
		}
		let Some(membership) = self.world.memberships.get(&id) else {
			return Err(Fault::invalid_argument(format!("no membership {id}")));
		};
		if membership.terminated {
			return Ok(Value::Null);
		}
		let (portal, connection) = (membership.portal, membership.connection);
		let emits = self.world.portal_disconnect(portal, connection);
		self.emits.extend(emits);
		if let Some(membership) = self.world.memberships.get_mut(&id) {
			membership.terminated = true;
		}
		Ok(Value::Null)
	}

	fn stream(&mut self, handle: HandleId, id: u64, method: &str, params: Value) -> Reply {
		let stream = self
			.world
			.streams
			.get_mut(&id)
			.filter(|s| !s.closed)
			.ok_or_else(|| Fault::invalid_operation("stream is closed"))?;
		match method {
			"read" => {
				let count: usize = arg(&params, "count")?;
				let n = count.min(stream.buffer.len());
				let data: Vec<u8> = stream.buffer.drain(..n).collect();
				Ok(json!({ "data": buffer::encode(&data) }))
			}
			"write" => {
				let data = bytes(&params, "data")?;
				stream.buffer.extend(&data);
				Ok(json!(data.len()))
			}
			"close" => {
				stream.closed = true;
				self.client.table.lock().remove(handle);
				Ok(Value::Null)
			}
			other => Err(no_method("stream", other)),
		}
	}

	fn handle_ref(&self, object: ObjectRef) -> Value {
		json!({ "handle": self.client.alloc(object) })
	}

	fn list<T: Serialize>(&self, items: Vec<T>) -> Value {
		json!({ "list": self.client.alloc(ObjectRef::List), "items": items })
	}

	fn process(&self, device: &str, mut desc: telco_protocol::ProcessDescriptor) -> Value {
		desc.handle = self.client.alloc(ObjectRef::Process {
			device: device.to_string(),
			pid: desc.pid,
		});
		json!(desc)
	}

	fn application(&self, device: &str, mut desc: ApplicationDescriptor) -> Value {
		desc.handle = self.client.alloc(ObjectRef::Application {
			device: device.to_string(),
			identifier: desc.identifier.clone(),
		});
		json!(desc)
	}
}

/// Runs one build of `entrypoint`, queueing the compiler signals it produces.
pub(crate) fn build(world: &World, compiler: u64, entrypoint: &str, watching: bool, emits: &mut Vec<Emit>) -> String {
	let target = ObjectRef::Compiler(compiler);
	emits.push(Emit::to(target.clone(), "starting", json!({})));
	for (n, text) in world.diagnostics.get(entrypoint).into_iter().flatten().enumerate() {
		emits.push(Emit::to(
			target.clone(),
			"diagnostics",
			json!({ "category": "error", "code": 2300 + n, "file": entrypoint, "text": text }),
		));
	}
	emits.push(Emit::to(target.clone(), "finished", json!({})));

	let bundle = format!("// {entrypoint}\n\"use strict\";\n");
	if watching {
		emits.push(Emit::to(target, "output", json!({ "bundle": bundle })));
	}
	bundle
}

fn no_method(kind: &str, method: &str) -> Fault {
	Fault::invalid_argument(format!("{kind} has no method {method:?}"))
}

fn remote_id(address: &str) -> String {
	format!("socket@{address}")
}

fn arg<T: DeserializeOwned>(params: &Value, key: &str) -> Reply<T> {
	let value = params.get(key).cloned().unwrap_or(Value::Null);
	serde_json::from_value(value).map_err(|e| Fault::invalid_argument(format!("invalid {key:?}: {e}")))
}

fn opt<T: DeserializeOwned + Default>(params: &Value, key: &str) -> Reply<T> {
	match params.get(key) {
		None | Some(Value::Null) => Ok(T::default()),
		Some(value) => serde_json::from_value(value.clone())
			.map_err(|e| Fault::invalid_argument(format!("invalid {key:?}: {e}"))),
	}
}

fn bytes(params: &Value, key: &str) -> Reply<Vec<u8>> {
	let encoded: String = arg(params, key)?;
	buffer::decode(&encoded).map_err(|e| Fault::invalid_argument(format!("invalid {key:?}: {e}")))
}

/// Rejects sources with unbalanced brackets or unterminated strings.
fn check_syntax(source: &str) -> Reply<()> {
	let mut stack = Vec::new();
	let mut quote: Option<char> = None;
	let mut escaped = false;
	let mut line = 1;

	for c in source.chars() {
		if c == '\n' {
			line += 1;
		}
		if let Some(q) = quote {
			match c {
				_ if escaped => escaped = false,
				'\\' => escaped = true,
				_ if c == q => quote = None,
				_ => {}
			}
			continue;
		}
		match c {
			'\'' | '"' | '`' => quote = Some(c),
			'(' | '[' | '{' => stack.push(c),
			')' | ']' | '}' => {
				let open = match c {
					')' => '(',
					']' => '[',
					_ => '{',
				};
				if stack.pop() != Some(open) {
					return Err(syntax_error(line, &format!("unexpected token '{c}'")));
				}
			}
			_ => {}
		}
	}
	if quote.is_some() {
		return Err(syntax_error(line, "unterminated string literal"));
	}
	if !stack.is_empty() {
		return Err(syntax_error(line, "unexpected end of input"));
	}
	Ok(())
}

fn syntax_error(line: usize, detail: &str) -> Fault {
	Fault::invalid_argument(format!("script(line {line}): SyntaxError: {detail}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn syntax_check_tracks_brackets_and_strings() {
		assert!(check_syntax("send({ a: [1, 2] })").is_ok());
		assert!(check_syntax("send(')')").is_ok());
		assert!(check_syntax("send(\"a\\\"b\")").is_ok());

		let err = check_syntax("send(1").unwrap_err();
		assert_eq!(err.code, ErrorCode::InvalidArgument);
		assert!(err.message.contains("unexpected end of input"));
		assert!(check_syntax("x]\n").unwrap_err().message.contains("line 1"));
		assert!(check_syntax("'open").is_err());
	}

	#[test]
	fn table_counts_only_held_handles() {
		let mut table = HandleTable::default();
		let a = table.insert(ObjectRef::Manager(1), false);
		let b = table.insert(ObjectRef::Device("local".into()), true);
		assert_ne!(a, b);
		assert_ne!(a, NIL_HANDLE);
		assert_eq!(table.held(), 1);

		table.connect(a, "added".into());
		table.connect(a, "added".into());
		table.disconnect(a, "added");
		assert!(table.is_connected(a, "added"));
		table.disconnect(a, "added");
		assert!(!table.is_connected(a, "added"));

		assert!(table.remove(a).is_some());
		assert!(table.remove(a).is_none());
		assert_eq!(table.held(), 0);
	}

	#[test]
	fn builds_report_configured_diagnostics() {
		let mut world = World::new();
		world
			.diagnostics
			.insert("agent.ts".into(), vec!["Cannot find name 'x'.".into()]);

		let mut emits = Vec::new();
		let bundle = build(&world, 7, "agent.ts", false, &mut emits);
		let names: Vec<_> = emits.iter().map(|e| e.signal).collect();
		assert_eq!(names, ["starting", "diagnostics", "finished"]);
		assert_eq!(emits[1].params["text"], "Cannot find name 'x'.");
		assert!(bundle.contains("agent.ts"));

		emits.clear();
		build(&world, 7, "main.ts", true, &mut emits);
		let names: Vec<_> = emits.iter().map(|e| e.signal).collect();
		assert_eq!(names, ["starting", "finished", "output"]);
	}
}

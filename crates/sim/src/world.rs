//! Engine-side model of everything the simulator pretends to control.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use telco_protocol::{
	ApplicationDescriptor, Bus, ChildDescriptor, ChildOrigin, CrashDescriptor, DeviceDescriptor, DeviceType,
	ErrorCode, Icon, NIL_HANDLE, ProcessDescriptor, Scope, SessionDetachReason, SpawnDescriptor, Stdio,
};

use crate::portal::{Role, SimPortal};

/// An engine error to put in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
	pub code: ErrorCode,
	pub message: String,
}

impl Fault {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}

	pub fn invalid_argument(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::InvalidArgument, message)
	}

	pub fn invalid_operation(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::InvalidOperation, message)
	}

	pub fn process_not_found(pid: u32) -> Self {
		Self::new(ErrorCode::ProcessNotFound, format!("unable to find process with pid {pid}"))
	}
}

pub(crate) type Reply<T = Value> = Result<T, Fault>;

/// What a client handle refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ObjectRef {
	Manager(u64),
	Device(String),
	Process { device: String, pid: u32 },
	Application { device: String, identifier: String },
	Spawn { device: String, pid: u32 },
	Child { device: String, pid: u32 },
	Crash { device: String, pid: u32 },
	Session(u64),
	Script(u64),
	Compiler(u64),
	Portal(u64),
	Membership(u64),
	Stream(u64),
	List,
}

impl ObjectRef {
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Manager(_) => "manager",
			Self::Device(_) => "device",
			Self::Process { .. } => "process",
			Self::Application { .. } => "application",
			Self::Spawn { .. } => "spawn",
			Self::Child { .. } => "child",
			Self::Crash { .. } => "crash",
			Self::Session(_) => "session",
			Self::Script(_) => "script",
			Self::Compiler(_) => "compiler",
			Self::Portal(_) => "portal",
			Self::Membership(_) => "membership",
			Self::Stream(_) => "stream",
			Self::List => "list",
		}
	}
}

/// Who receives an emitted signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Audience {
	/// Every open device manager.
	Managers,
	Object(ObjectRef),
}

/// A signal waiting to be sent to every connected subscriber.
#[derive(Debug, Clone)]
pub(crate) struct Emit {
	pub audience: Audience,
	pub signal: &'static str,
	pub params: Value,
	/// Descriptors inside `params` (by JSON pointer) that need a borrowed handle.
	pub borrow: Vec<(&'static str, ObjectRef)>,
}

impl Emit {
	pub fn to(object: ObjectRef, signal: &'static str, params: Value) -> Self {
		Self {
			audience: Audience::Object(object),
			signal,
			params,
			borrow: Vec::new(),
		}
	}

	pub fn managers(signal: &'static str, params: Value) -> Self {
		Self {
			audience: Audience::Managers,
			signal,
			params,
			borrow: Vec::new(),
		}
	}

	pub fn borrowing(mut self, pointer: &'static str, object: ObjectRef) -> Self {
		self.borrow.push((pointer, object));
		self
	}
}

#[derive(Debug, Clone)]
pub(crate) struct SimProcess {
	pub name: String,
	pub path: String,
	pub suspended: bool,
	pub stdio: Stdio,
}

#[derive(Debug, Clone)]
pub(crate) struct SimApp {
	pub identifier: String,
	pub name: String,
	pub pid: u32,
}

#[derive(Debug)]
pub(crate) struct SimDevice {
	pub desc: DeviceDescriptor,
	/// Not listed by managers (a portal's own device).
	pub hidden: bool,
	pub lost: bool,
	pub processes: BTreeMap<u32, SimProcess>,
	pub applications: Vec<SimApp>,
	pub frontmost: Option<String>,
	pub spawn_gating: bool,
	pub pending_spawn: Vec<SpawnDescriptor>,
	pub pending_children: Vec<ChildDescriptor>,
	pub crashes: HashMap<u32, CrashDescriptor>,
	pub injections: HashSet<u32>,
	next_pid: u32,
	next_injection: u32,
}

impl SimDevice {
	pub fn new(id: &str, name: &str, kind: DeviceType) -> Self {
		let bus = match kind {
			DeviceType::Local => Bus::Local,
			DeviceType::Usb => Bus::Usb,
			DeviceType::Remote => Bus::Network,
		};
		Self {
			desc: DeviceDescriptor {
				handle: NIL_HANDLE,
				id: id.to_string(),
				name: name.to_string(),
				kind,
				bus,
				icon: None,
			},
			hidden: false,
			lost: false,
			processes: BTreeMap::new(),
			applications: Vec::new(),
			frontmost: None,
			spawn_gating: false,
			pending_spawn: Vec::new(),
			pending_children: Vec::new(),
			crashes: HashMap::new(),
			injections: HashSet::new(),
			next_pid: 1000,
			next_injection: 1,
		}
	}

	pub fn id(&self) -> &str {
		&self.desc.id
	}

	pub fn allocate_pid(&mut self) -> u32 {
		while self.processes.contains_key(&self.next_pid) {
			self.next_pid += 1;
		}
		let pid = self.next_pid;
		self.next_pid += 1;
		pid
	}

	pub fn allocate_injection(&mut self) -> u32 {
		let id = self.next_injection;
		self.next_injection += 1;
		self.injections.insert(id);
		id
	}

	pub fn add_process(&mut self, pid: u32, name: &str, stdio: Stdio, suspended: bool) {
		self.processes.insert(
			pid,
			SimProcess {
				name: name.to_string(),
				path: format!("/usr/bin/{name}"),
				suspended,
				stdio,
			},
		);
	}

	/// Lowest pid whose name matches exactly.
	pub fn pid_by_name(&self, name: &str) -> Option<u32> {
		self.processes.iter().find(|(_, p)| p.name == name).map(|(pid, _)| *pid)
	}

	pub fn process_descriptor(&self, pid: u32, scope: Scope) -> Option<ProcessDescriptor> {
		let process = self.processes.get(&pid)?;
		let mut parameters = Map::new();
		if scope >= Scope::Metadata {
			parameters.insert("path".into(), json!(process.path));
			parameters.insert("user".into(), json!("root"));
		}
		if scope >= Scope::Full {
			parameters.insert("icons".into(), icons());
		}
		Some(ProcessDescriptor {
			handle: NIL_HANDLE,
			pid,
			name: process.name.clone(),
			parameters,
		})
	}

	pub fn application_descriptor(&self, app: &SimApp, scope: Scope) -> ApplicationDescriptor {
		let mut parameters = Map::new();
		if scope >= Scope::Metadata {
			parameters.insert("version".into(), json!("1.0"));
		}
		if scope >= Scope::Full {
			parameters.insert("icons".into(), icons());
		}
		ApplicationDescriptor {
			handle: NIL_HANDLE,
			identifier: app.identifier.clone(),
			name: app.name.clone(),
			pid: app.pid,
			parameters,
		}
	}

	pub fn system_parameters(&self) -> Map<String, Value> {
		let mut params = Map::new();
		params.insert("os".into(), json!({ "id": "linux", "name": "Linux", "version": "6.8" }));
		params.insert("platform".into(), json!("linux"));
		params.insert("arch".into(), json!("x64"));
		params.insert("access".into(), json!("full"));
		params.insert("name".into(), json!(self.desc.name));
		params
	}

	/// Removes a process and everything that referred to it.
	pub fn remove_process(&mut self, pid: u32) -> Option<SimProcess> {
		let process = self.processes.remove(&pid)?;
		self.pending_spawn.retain(|s| s.pid != pid);
		self.pending_children.retain(|c| c.pid != pid);
		for app in &mut self.applications {
			if app.pid == pid {
				app.pid = 0;
			}
		}
		Some(process)
	}
}

fn icons() -> Value {
	let icon = Icon {
		format: "rgba".to_string(),
		width: 1,
		height: 1,
		image: vec![0x20, 0x40, 0x80, 0xff],
	};
	json!([icon])
}

#[derive(Debug)]
pub(crate) struct SimSession {
	pub device: String,
	pub pid: u32,
	pub persist_timeout: u32,
	pub detached: bool,
	pub child_gating: bool,
	pub peer: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SimScript {
	pub session: u64,
	pub loaded: bool,
	pub destroyed: bool,
	pub eternal: bool,
}

#[derive(Debug)]
pub(crate) struct SimMembership {
	pub portal: u64,
	pub connection: u32,
	pub terminated: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SimStream {
	pub buffer: VecDeque<u8>,
	pub closed: bool,
}

#[derive(Debug)]
pub(crate) struct World {
	next_id: u64,
	pub devices: IndexMap<String, SimDevice>,
	/// manager id -> closed
	pub managers: HashMap<u64, bool>,
	pub sessions: HashMap<u64, SimSession>,
	pub scripts: HashMap<u64, SimScript>,
	/// compiler id -> watched entrypoints
	pub compilers: HashMap<u64, Vec<String>>,
	/// entrypoint -> diagnostics produced when building it
	pub diagnostics: HashMap<String, Vec<String>>,
	pub portals: HashMap<u64, SimPortal>,
	pub memberships: HashMap<u64, SimMembership>,
	pub streams: HashMap<u64, SimStream>,
	/// method -> error its next call fails with
	pub failures: HashMap<String, Fault>,
}

impl World {
	pub fn new() -> Self {
		let mut local = SimDevice::new("local", "Local System", DeviceType::Local);
		local.add_process(1, "init", Stdio::Inherit, false);

		let mut devices = IndexMap::new();
		devices.insert(local.id().to_string(), local);

		Self {
			next_id: 1,
			devices,
			managers: HashMap::new(),
			sessions: HashMap::new(),
			scripts: HashMap::new(),
			compilers: HashMap::new(),
			diagnostics: HashMap::new(),
			portals: HashMap::new(),
			memberships: HashMap::new(),
			streams: HashMap::new(),
			failures: HashMap::new(),
		}
	}

	pub fn next_id(&mut self) -> u64 {
		let id = self.next_id;
		self.next_id += 1;
		id
	}

	pub fn device(&self, id: &str) -> Reply<&SimDevice> {
		match self.devices.get(id) {
			Some(device) if !device.lost => Ok(device),
			Some(_) => Err(Fault::invalid_operation("device is gone")),
			None => Err(Fault::new(ErrorCode::NotFound, format!("device {id:?} not found"))),
		}
	}

	pub fn device_mut(&mut self, id: &str) -> Reply<&mut SimDevice> {
		match self.devices.get_mut(id) {
			Some(device) if !device.lost => Ok(device),
			Some(_) => Err(Fault::invalid_operation("device is gone")),
			None => Err(Fault::new(ErrorCode::NotFound, format!("device {id:?} not found"))),
		}
	}

	pub fn visible_devices(&self) -> impl Iterator<Item = &SimDevice> {
		self.devices.values().filter(|d| !d.hidden && !d.lost)
	}

	pub fn add_device(&mut self, device: SimDevice) -> Vec<Emit> {
		let id = device.id().to_string();
		let desc = device.desc.clone();
		self.devices.insert(id.clone(), device);
		vec![
			Emit::managers("added", json!({ "device": desc })).borrowing("/device", ObjectRef::Device(id)),
			Emit::managers("changed", json!({})),
		]
	}

	/// Marks a device lost, detaching its sessions.
	pub fn remove_device(&mut self, id: &str) -> Option<Vec<Emit>> {
		let device = self.devices.get_mut(id)?;
		if device.lost {
			return None;
		}
		device.lost = true;
		let desc = device.desc.clone();

		let mut emits = vec![
			Emit::to(ObjectRef::Device(id.to_string()), "lost", json!({})),
			Emit::managers("removed", json!({ "device": desc })).borrowing("/device", ObjectRef::Device(id.to_string())),
			Emit::managers("changed", json!({})),
		];
		let sessions: Vec<u64> = self
			.sessions
			.iter()
			.filter(|(_, s)| s.device == id && !s.detached)
			.map(|(sid, _)| *sid)
			.collect();
		for sid in sessions {
			emits.extend(self.detach_session(sid, SessionDetachReason::DeviceLost, None));
		}
		Some(emits)
	}

	pub fn session(&self, id: u64) -> Reply<&SimSession> {
		match self.sessions.get(&id) {
			Some(s) if !s.detached => Ok(s),
			Some(_) => Err(Fault::invalid_operation("session is gone")),
			None => Err(Fault::invalid_argument(format!("no session {id}"))),
		}
	}

	pub fn session_mut(&mut self, id: u64) -> Reply<&mut SimSession> {
		match self.sessions.get_mut(&id) {
			Some(s) if !s.detached => Ok(s),
			Some(_) => Err(Fault::invalid_operation("session is gone")),
			None => Err(Fault::invalid_argument(format!("no session {id}"))),
		}
	}

	/// Detaches a session and destroys its non-eternal scripts.
	pub fn detach_session(&mut self, id: u64, reason: SessionDetachReason, crash: Option<&CrashDescriptor>) -> Vec<Emit> {
		let Some(session) = self.sessions.get_mut(&id) else {
			return Vec::new();
		};
		if session.detached {
			return Vec::new();
		}
		session.detached = true;
		let (device, pid) = (session.device.clone(), session.pid);

		let mut emits = Vec::new();
		for (script_id, script) in self.scripts.iter_mut() {
			if script.session == id && !script.destroyed && !script.eternal {
				script.destroyed = true;
				emits.push(Emit::to(ObjectRef::Script(*script_id), "destroyed", json!({})));
			}
		}

		let mut detached = Emit::to(
			ObjectRef::Session(id),
			"detached",
			json!({ "reason": reason, "crash": crash }),
		);
		if crash.is_some() {
			detached = detached.borrowing("/crash", ObjectRef::Crash { device, pid });
		}
		emits.push(detached);
		emits
	}

	pub fn sessions_on(&self, device: &str, pid: u32) -> Vec<u64> {
		let mut ids: Vec<u64> = self
			.sessions
			.iter()
			.filter(|(_, s)| s.device == device && s.pid == pid && !s.detached)
			.map(|(id, _)| *id)
			.collect();
		ids.sort_unstable();
		ids
	}

	/// Ends a process: pending entries go, sessions detach with `reason`.
	pub fn end_process(&mut self, device: &str, pid: u32, reason: SessionDetachReason) -> Reply<Vec<Emit>> {
		let dev = self.device_mut(device)?;
		let was_pending: Vec<SpawnDescriptor> = dev.pending_spawn.iter().filter(|s| s.pid == pid).cloned().collect();
		let was_child: Vec<ChildDescriptor> = dev.pending_children.iter().filter(|c| c.pid == pid).cloned().collect();
		if dev.remove_process(pid).is_none() {
			return Err(Fault::process_not_found(pid));
		}

		let mut emits = Vec::new();
		for spawn in was_pending {
			emits.push(
				Emit::to(ObjectRef::Device(device.to_string()), "spawn_removed", json!({ "spawn": spawn }))
					.borrowing("/spawn", ObjectRef::Spawn { device: device.to_string(), pid }),
			);
		}
		for child in was_child {
			emits.push(
				Emit::to(ObjectRef::Device(device.to_string()), "child_removed", json!({ "child": child }))
					.borrowing("/child", ObjectRef::Child { device: device.to_string(), pid }),
			);
		}
		let crash = self
			.devices
			.get(device)
			.and_then(|d| d.crashes.get(&pid))
			.filter(|_| reason == SessionDetachReason::ProcessTerminated)
			.cloned();
		for sid in self.sessions_on(device, pid) {
			emits.extend(self.detach_session(sid, reason, crash.as_ref()));
		}
		Ok(emits)
	}

	/// New process appearing on `device`, held if spawn gating is on.
	pub fn launch(&mut self, device: &str, name: &str) -> Reply<(u32, Vec<Emit>)> {
		let dev = self.device_mut(device)?;
		let pid = dev.allocate_pid();
		let gated = dev.spawn_gating;
		dev.add_process(pid, name, Stdio::Inherit, gated);

		let mut emits = Vec::new();
		if gated {
			let spawn = SpawnDescriptor {
				handle: NIL_HANDLE,
				pid,
				identifier: Some(name.to_string()),
			};
			dev.pending_spawn.push(spawn.clone());
			emits.push(
				Emit::to(ObjectRef::Device(device.to_string()), "spawn_added", json!({ "spawn": spawn }))
					.borrowing("/spawn", ObjectRef::Spawn { device: device.to_string(), pid }),
			);
		}
		Ok((pid, emits))
	}

	/// `parent` forks a child. Held when a session on the parent gates children.
	pub fn fork(&mut self, device: &str, parent: u32, origin: ChildOrigin) -> Reply<(u32, Vec<Emit>)> {
		let gated = self
			.sessions_on(device, parent)
			.iter()
			.any(|sid| self.sessions.get(sid).is_some_and(|s| s.child_gating));

		let dev = self.device_mut(device)?;
		let Some(parent_proc) = dev.processes.get(&parent).cloned() else {
			return Err(Fault::process_not_found(parent));
		};
		let pid = dev.allocate_pid();
		dev.add_process(pid, &parent_proc.name, parent_proc.stdio, gated);

		let mut emits = Vec::new();
		if gated {
			let child = ChildDescriptor {
				handle: NIL_HANDLE,
				pid,
				parent_pid: parent,
				origin,
				identifier: None,
				path: Some(parent_proc.path.clone()),
				argv: Some(vec![parent_proc.path]),
				envp: None,
			};
			dev.pending_children.push(child.clone());
			emits.push(
				Emit::to(ObjectRef::Device(device.to_string()), "child_added", json!({ "child": child }))
					.borrowing("/child", ObjectRef::Child { device: device.to_string(), pid }),
			);
		}
		Ok((pid, emits))
	}

	/// Kills `pid` with a crash report.
	pub fn crash(&mut self, device: &str, pid: u32, summary: &str) -> Reply<Vec<Emit>> {
		let dev = self.device_mut(device)?;
		let Some(process) = dev.processes.get(&pid) else {
			return Err(Fault::process_not_found(pid));
		};
		let crash = CrashDescriptor {
			handle: NIL_HANDLE,
			pid,
			process_name: process.name.clone(),
			summary: summary.to_string(),
			report: format!("Process {pid} ({}) crashed: {summary}", process.name),
			parameters: Map::new(),
		};
		dev.crashes.insert(pid, crash.clone());

		let mut emits = vec![
			Emit::to(
				ObjectRef::Device(device.to_string()),
				"process_crashed",
				json!({ "crash": crash }),
			)
			.borrowing("/crash", ObjectRef::Crash { device: device.to_string(), pid }),
		];
		emits.extend(self.end_process(device, pid, SessionDetachReason::ProcessTerminated)?);
		Ok(emits)
	}

	/// Registers a new connection on a started portal.
	pub fn portal_connect(&mut self, portal: u64, role: Role, address: &str) -> Reply<(u32, Vec<Emit>)> {
		let sim = self
			.portals
			.get_mut(&portal)
			.filter(|p| p.started)
			.ok_or_else(|| Fault::new(ErrorCode::ServerNotRunning, "portal is not running"))?;
		let id = sim.connect(role, address);
		let signal = match role {
			Role::Node => "node_connected",
			Role::Controller => "controller_connected",
		};
		let emit = Emit::to(
			ObjectRef::Portal(portal),
			signal,
			json!({ "connection_id": id, "remote_address": address }),
		);
		Ok((id, vec![emit]))
	}

	/// Drops one portal connection, ending any membership riding on it.
	pub fn portal_disconnect(&mut self, portal: u64, connection: u32) -> Vec<Emit> {
		let Some(conn) = self.portals.get_mut(&portal).and_then(|p| p.disconnect(connection)) else {
			return Vec::new();
		};
		self.disconnected(portal, connection, conn)
	}

	/// Drops every connection of a portal.
	pub fn portal_disconnect_all(&mut self, portal: u64) -> Vec<Emit> {
		let Some(sim) = self.portals.get_mut(&portal) else {
			return Vec::new();
		};
		let mut emits = Vec::new();
		for (id, conn) in sim.disconnect_all() {
			emits.extend(self.disconnected(portal, id, conn));
		}
		emits
	}

	fn disconnected(&mut self, portal: u64, connection: u32, conn: crate::portal::PortalConnection) -> Vec<Emit> {
		for membership in self.memberships.values_mut() {
			if membership.portal == portal && membership.connection == connection {
				membership.terminated = true;
			}
		}

		let mut emits = Vec::new();
		if let Some(app) = &conn.application {
			let device = self
				.portals
				.get(&portal)
				.map(|p| p.device_id.clone())
				.unwrap_or_default();
			emits.push(
				Emit::to(
					ObjectRef::Portal(portal),
					"node_left",
					json!({ "connection_id": connection, "application": app }),
				)
				.borrowing(
					"/application",
					ObjectRef::Application {
						device,
						identifier: app.identifier.clone(),
					},
				),
			);
		}
		let signal = match conn.role {
			Role::Node => "node_disconnected",
			Role::Controller => "controller_disconnected",
		};
		emits.push(Emit::to(
			ObjectRef::Portal(portal),
			signal,
			json!({ "connection_id": connection, "remote_address": conn.address }),
		));
		emits
	}

	/// Live portal with its cluster endpoint on `port`.
	pub fn portal_on_port(&mut self, port: u16) -> Option<(u64, &mut SimPortal)> {
		self.portals
			.iter_mut()
			.find(|(_, p)| p.started && p.cluster.port == port)
			.map(|(id, p)| (*id, p))
	}

	/// Live portal accepting controllers on `port`.
	pub fn portal_on_control_port(&mut self, port: u16) -> Option<(u64, &mut SimPortal)> {
		self.portals
			.iter_mut()
			.find(|(_, p)| p.started && p.control_port() == port)
			.map(|(id, p)| (*id, p))
	}
}

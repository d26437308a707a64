//! Signal dispatch bridge.
//!
//! The engine delivers signals as `{handle, signal, params}` events on the
//! connection's dispatch loop. Each wrapper object that supports `on` owns a
//! [`SignalBridge`]: the first subscription registers a FIFO for the object's
//! handle and spawns one consumer task that decodes each event into the
//! object's signal enum and calls the matching handlers in subscription order.
//! Callbacks therefore never run on the dispatch loop, and events for one
//! object are delivered in the order the engine emitted them.
//!
//! Handles inside signal payloads are [`HandleKind::Borrowed`]: they are
//! valid while the callback runs and are never released by the client.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use telco_protocol::buffer::decode as decode_base64;
use telco_protocol::{
	ApplicationDescriptor, ChildDescriptor, CrashDescriptor, DeviceDescriptor, HandleId, SessionDetachReason,
	SpawnDescriptor,
};
use telco_runtime::{Channel, DISCONNECT, Error, Event, HandleKind, Result};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::context::Context;
use crate::device::Device;
use crate::handlers::{HandlerEntry, HandlerFn, HandlerMap, Subscription, next_handler_id};
use crate::process::{Application, Child, Crash, Spawn};

/// Rewrites a raw payload before it is decoded.
pub type Transform = fn(Value) -> Value;

/// A closed set of signals one object type can emit.
pub trait Signal: Sized + Send + Sync + 'static {
	/// Wire names accepted by `on`.
	const NAMES: &'static [&'static str];

	/// Payload rewrites applied before [`Signal::decode`], by wire name.
	const TRANSFORMS: &'static [(&'static str, Transform)] = &[];

	/// Wire name of this signal.
	fn name(&self) -> &'static str;

	/// Builds the typed signal from a (possibly transformed) payload.
	fn decode(name: &str, params: Value, ctx: &Context) -> Result<Self>;
}

fn transform<S: Signal>(name: &str, params: Value) -> Value {
	match S::TRANSFORMS.iter().find(|(n, _)| *n == name) {
		Some((_, f)) => f(params),
		None => params,
	}
}

fn take<T: DeserializeOwned>(params: &mut Value, key: &str) -> Result<T> {
	let value = params.get_mut(key).map(Value::take).unwrap_or(Value::Null);
	serde_json::from_value(value).map_err(|e| Error::Protocol(format!("signal field {key}: {e}")))
}

fn take_bytes(params: &mut Value, key: &str) -> Result<Option<Vec<u8>>> {
	let encoded: Option<String> = take(params, key)?;
	encoded
		.map(|s| decode_base64(&s).map_err(|e| Error::Protocol(format!("signal field {key}: {e}"))))
		.transpose()
}

fn unknown(kind: &str, name: &str) -> Error {
	Error::Protocol(format!("{kind} has no signal {name:?}"))
}

/// Signals emitted by a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug)]
pub enum ManagerSignal {
	Added(Device),
	Removed(Device),
	Changed,
}

impl Signal for ManagerSignal {
	const NAMES: &'static [&'static str] = &["added", "removed", "changed"];

	fn name(&self) -> &'static str {
		match self {
			Self::Added(_) => "added",
			Self::Removed(_) => "removed",
			Self::Changed => "changed",
		}
	}

	fn decode(name: &str, mut params: Value, ctx: &Context) -> Result<Self> {
		let mut device = || -> Result<Device> {
			let desc: DeviceDescriptor = take(&mut params, "device")?;
			Ok(Device::adopt(ctx, desc, HandleKind::Borrowed))
		};
		match name {
			"added" => Ok(Self::Added(device()?)),
			"removed" => Ok(Self::Removed(device()?)),
			"changed" => Ok(Self::Changed),
			other => Err(unknown("device manager", other)),
		}
	}
}

/// Signals emitted by a [`Device`].
#[derive(Debug)]
pub enum DeviceSignal {
	SpawnAdded(Spawn),
	SpawnRemoved(Spawn),
	ChildAdded(Child),
	ChildRemoved(Child),
	ProcessCrashed(Crash),
	/// Output of a process spawned with [`Stdio::Pipe`](telco_protocol::Stdio::Pipe).
	Output {
		pid: u32,
		fd: i32,
		data: Vec<u8>,
	},
	Uninjected {
		id: u32,
	},
	Lost,
}

impl Signal for DeviceSignal {
	const NAMES: &'static [&'static str] = &[
		"spawn_added",
		"spawn_removed",
		"child_added",
		"child_removed",
		"process_crashed",
		"output",
		"uninjected",
		"lost",
	];

	fn name(&self) -> &'static str {
		match self {
			Self::SpawnAdded(_) => "spawn_added",
			Self::SpawnRemoved(_) => "spawn_removed",
			Self::ChildAdded(_) => "child_added",
			Self::ChildRemoved(_) => "child_removed",
			Self::ProcessCrashed(_) => "process_crashed",
			Self::Output { .. } => "output",
			Self::Uninjected { .. } => "uninjected",
			Self::Lost => "lost",
		}
	}

	fn decode(name: &str, mut params: Value, ctx: &Context) -> Result<Self> {
		match name {
			"spawn_added" | "spawn_removed" => {
				let desc: SpawnDescriptor = take(&mut params, "spawn")?;
				let spawn = Spawn::adopt(ctx, desc, HandleKind::Borrowed);
				Ok(if name == "spawn_added" {
					Self::SpawnAdded(spawn)
				} else {
					Self::SpawnRemoved(spawn)
				})
			}
			"child_added" | "child_removed" => {
				let desc: ChildDescriptor = take(&mut params, "child")?;
				let child = Child::adopt(ctx, desc, HandleKind::Borrowed);
				Ok(if name == "child_added" {
					Self::ChildAdded(child)
				} else {
					Self::ChildRemoved(child)
				})
			}
			"process_crashed" => {
				let desc: CrashDescriptor = take(&mut params, "crash")?;
				Ok(Self::ProcessCrashed(Crash::adopt(ctx, desc, HandleKind::Borrowed)))
			}
			"output" => Ok(Self::Output {
				pid: take(&mut params, "pid")?,
				fd: take(&mut params, "fd")?,
				data: take_bytes(&mut params, "data")?.unwrap_or_default(),
			}),
			"uninjected" => Ok(Self::Uninjected {
				id: take(&mut params, "id")?,
			}),
			"lost" => Ok(Self::Lost),
			other => Err(unknown("device", other)),
		}
	}
}

/// Signals emitted by a [`Session`](crate::Session).
#[derive(Debug)]
pub enum SessionSignal {
	Detached {
		reason: SessionDetachReason,
		crash: Option<Crash>,
	},
}

impl Signal for SessionSignal {
	const NAMES: &'static [&'static str] = &["detached"];

	fn name(&self) -> &'static str {
		"detached"
	}

	fn decode(name: &str, mut params: Value, ctx: &Context) -> Result<Self> {
		match name {
			"detached" => {
				let reason = take(&mut params, "reason")?;
				let crash: Option<CrashDescriptor> = take(&mut params, "crash")?;
				Ok(Self::Detached {
					reason,
					crash: crash.map(|desc| Crash::adopt(ctx, desc, HandleKind::Borrowed)),
				})
			}
			other => Err(unknown("session", other)),
		}
	}
}

/// Signals emitted by a [`Script`](crate::Script).
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptSignal {
	/// A message the script posted, with its optional binary payload.
	Message { message: String, data: Option<Vec<u8>> },
	Destroyed,
}

impl Signal for ScriptSignal {
	const NAMES: &'static [&'static str] = &["message", "destroyed"];

	fn name(&self) -> &'static str {
		match self {
			Self::Message { .. } => "message",
			Self::Destroyed => "destroyed",
		}
	}

	fn decode(name: &str, mut params: Value, _ctx: &Context) -> Result<Self> {
		match name {
			"message" => Ok(Self::Message {
				message: take(&mut params, "message")?,
				data: take_bytes(&mut params, "data")?,
			}),
			"destroyed" => Ok(Self::Destroyed),
			other => Err(unknown("script", other)),
		}
	}
}

/// Signals emitted by a [`Compiler`](crate::Compiler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerSignal {
	Starting,
	Finished,
	Output { bundle: String },
	/// The `text` field of the engine's diagnostics record.
	Diagnostics(String),
	FileChanged,
}

/// Reduces a diagnostics record to its human-readable text.
fn diagnostics_text(mut params: Value) -> Value {
	params.get_mut("text").map(Value::take).unwrap_or(Value::Null)
}

impl Signal for CompilerSignal {
	const NAMES: &'static [&'static str] = &["starting", "finished", "output", "diagnostics", "file_changed"];
	const TRANSFORMS: &'static [(&'static str, Transform)] = &[("diagnostics", diagnostics_text)];

	fn name(&self) -> &'static str {
		match self {
			Self::Starting => "starting",
			Self::Finished => "finished",
			Self::Output { .. } => "output",
			Self::Diagnostics(_) => "diagnostics",
			Self::FileChanged => "file_changed",
		}
	}

	fn decode(name: &str, mut params: Value, _ctx: &Context) -> Result<Self> {
		match name {
			"starting" => Ok(Self::Starting),
			"finished" => Ok(Self::Finished),
			"output" => Ok(Self::Output {
				bundle: take(&mut params, "bundle")?,
			}),
			"diagnostics" => serde_json::from_value(params)
				.map(Self::Diagnostics)
				.map_err(|e| Error::Protocol(format!("diagnostics text: {e}"))),
			"file_changed" => Ok(Self::FileChanged),
			other => Err(unknown("compiler", other)),
		}
	}
}

/// Signals emitted by a [`PortalService`](crate::PortalService).
#[derive(Debug)]
pub enum PortalSignal {
	NodeConnected { connection_id: u32, remote_address: String },
	NodeJoined { connection_id: u32, application: Application },
	NodeLeft { connection_id: u32, application: Application },
	NodeDisconnected { connection_id: u32, remote_address: String },
	ControllerConnected { connection_id: u32, remote_address: String },
	ControllerDisconnected { connection_id: u32, remote_address: String },
	Authenticated { connection_id: u32, session_info: String },
	Subscribe { connection_id: u32 },
	Message { connection_id: u32, json: String, data: Option<Vec<u8>> },
}

impl Signal for PortalSignal {
	const NAMES: &'static [&'static str] = &[
		"node_connected",
		"node_joined",
		"node_left",
		"node_disconnected",
		"controller_connected",
		"controller_disconnected",
		"authenticated",
		"subscribe",
		"message",
	];

	fn name(&self) -> &'static str {
		match self {
			Self::NodeConnected { .. } => "node_connected",
			Self::NodeJoined { .. } => "node_joined",
			Self::NodeLeft { .. } => "node_left",
			Self::NodeDisconnected { .. } => "node_disconnected",
			Self::ControllerConnected { .. } => "controller_connected",
			Self::ControllerDisconnected { .. } => "controller_disconnected",
			Self::Authenticated { .. } => "authenticated",
			Self::Subscribe { .. } => "subscribe",
			Self::Message { .. } => "message",
		}
	}

	fn decode(name: &str, mut params: Value, ctx: &Context) -> Result<Self> {
		let connection_id: u32 = take(&mut params, "connection_id")?;
		match name {
			"node_connected" | "node_disconnected" | "controller_connected" | "controller_disconnected" => {
				let remote_address: String = take(&mut params, "remote_address")?;
				Ok(match name {
					"node_connected" => Self::NodeConnected {
						connection_id,
						remote_address,
					},
					"node_disconnected" => Self::NodeDisconnected {
						connection_id,
						remote_address,
					},
					"controller_connected" => Self::ControllerConnected {
						connection_id,
						remote_address,
					},
					_ => Self::ControllerDisconnected {
						connection_id,
						remote_address,
					},
				})
			}
			"node_joined" | "node_left" => {
				let desc: ApplicationDescriptor = take(&mut params, "application")?;
				let application = Application::adopt(ctx, desc, HandleKind::Borrowed);
				Ok(if name == "node_joined" {
					Self::NodeJoined {
						connection_id,
						application,
					}
				} else {
					Self::NodeLeft {
						connection_id,
						application,
					}
				})
			}
			"authenticated" => {
				let info: Value = take(&mut params, "session_info")?;
				let session_info = match info {
					Value::String(s) => s,
					other => other.to_string(),
				};
				Ok(Self::Authenticated {
					connection_id,
					session_info,
				})
			}
			"subscribe" => Ok(Self::Subscribe { connection_id }),
			"message" => Ok(Self::Message {
				connection_id,
				json: take(&mut params, "json")?,
				data: take_bytes(&mut params, "data")?,
			}),
			other => Err(unknown("portal", other)),
		}
	}
}

struct BridgeState<S: Signal> {
	ctx: Context,
	handle: HandleId,
	kind: &'static str,
	handlers: HandlerMap<S, &'static str>,
}

impl<S: Signal> BridgeState<S> {
	fn deliver(&self, event: Event) {
		let Some(name) = S::NAMES.iter().copied().find(|n| *n == event.signal) else {
			warn!(kind = self.kind, handle = self.handle, signal = %event.signal, "unknown signal");
			return;
		};

		let handlers: Vec<HandlerFn<S>> = self
			.handlers
			.lock()
			.values()
			.filter(|entry| entry.meta == name)
			.map(|entry| Arc::clone(&entry.handler))
			.collect();
		if handlers.is_empty() {
			trace!(kind = self.kind, signal = name, "no handlers, dropping");
			return;
		}

		let params = transform::<S>(name, event.params);
		match S::decode(name, params, &self.ctx) {
			Ok(signal) => {
				for handler in handlers {
					handler(&signal);
				}
			}
			Err(e) => warn!(kind = self.kind, signal = name, error = %e, "undecodable signal payload"),
		}
	}
}

/// Per-object subscription table plus the task that feeds it.
pub(crate) struct SignalBridge<S: Signal> {
	state: Arc<BridgeState<S>>,
	consumer: Mutex<Option<oneshot::Sender<()>>>,
}

impl<S: Signal> SignalBridge<S> {
	pub(crate) fn new(ctx: &Context, channel: &Channel) -> Self {
		Self {
			state: Arc::new(BridgeState {
				ctx: ctx.clone(),
				handle: channel.id(),
				kind: channel.kind(),
				handlers: Arc::new(Mutex::new(IndexMap::new())),
			}),
			consumer: Mutex::new(None),
		}
	}

	/// Registers `callback` for the signal named `name`.
	///
	/// The engine side is connected when the first handler for `name` is
	/// added and disconnected when the last one is dropped.
	pub(crate) fn on<F>(&self, channel: &Channel, name: &str, callback: F) -> Result<Subscription>
	where
		F: Fn(&S) + Send + Sync + 'static,
	{
		let Some(name) = S::NAMES.iter().copied().find(|n| *n == name) else {
			return Err(Error::InvalidArgument(format!(
				"{} has no signal {name:?}; expected one of {:?}",
				self.state.kind,
				S::NAMES
			)));
		};
		if !channel.is_live() {
			return Err(Error::NilHandle { kind: channel.kind() });
		}

		self.ensure_consumer(channel)?;

		// The first handler for a name connects it on the engine side and the
		// last one to go disconnects it. Both decisions are taken under the
		// handler lock so the notifications stay paired.
		let id = next_handler_id();
		{
			let mut handlers = self.state.handlers.lock();
			if !handlers.values().any(|entry| entry.meta == name) {
				channel.connect_signal(name)?;
			}
			handlers.insert(
				id,
				HandlerEntry {
					id,
					meta: name,
					handler: Arc::new(callback),
				},
			);
		}

		let weak: Weak<BridgeState<S>> = Arc::downgrade(&self.state);
		Ok(Subscription::from_handler_map(
			id,
			&self.state.handlers,
			move |name: &&'static str, rest| {
				let Some(state) = weak.upgrade() else {
					return;
				};
				if !rest.values().any(|entry| entry.meta == *name) {
					state
						.ctx
						.connection()
						.notify(state.handle, DISCONNECT, json!({ "signal": *name }));
				}
			},
		))
	}

	fn ensure_consumer(&self, channel: &Channel) -> Result<()> {
		let mut consumer = self.consumer.lock();
		if consumer.is_some() {
			return Ok(());
		}

		let runtime = tokio::runtime::Handle::try_current()
			.map_err(|_| Error::InvalidArgument("signal handlers need a running tokio runtime".to_string()))?;

		let mut rx = channel.signals();
		let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
		let weak = Arc::downgrade(&self.state);
		runtime.spawn(async move {
			loop {
				tokio::select! {
					_ = &mut cancel_rx => break,
					event = rx.recv() => {
						let Some(event) = event else { break };
						let Some(state) = weak.upgrade() else { break };
						state.deliver(event);
					}
				}
			}
			trace!(handle = rx.handle(), "signal consumer stopped");
		});

		*consumer = Some(cancel_tx);
		Ok(())
	}

	#[cfg(test)]
	pub(crate) fn handler_count(&self) -> usize {
		self.state.handlers.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use telco_runtime::{CONNECT, Config, Connection, memory_pair};

	use super::*;

	fn ctx() -> Context {
		let (client, _engine) = memory_pair();
		Context::new(Arc::new(Connection::new(client)), Arc::new(Config::default()))
	}

	#[test]
	fn diagnostics_are_reduced_to_text() {
		let raw = json!({"category": "error", "code": 2304, "text": "Cannot find name 'x'."});
		let params = transform::<CompilerSignal>("diagnostics", raw);
		let signal = CompilerSignal::decode("diagnostics", params, &ctx()).unwrap();
		assert_eq!(signal, CompilerSignal::Diagnostics("Cannot find name 'x'.".to_string()));
	}

	#[test]
	fn other_signals_are_not_transformed() {
		let raw = json!({"bundle": "console.log(1)"});
		assert_eq!(transform::<CompilerSignal>("output", raw.clone()), raw);
		assert_eq!(transform::<ScriptSignal>("message", raw.clone()), raw);
	}

	#[test]
	fn output_payload_is_decoded_from_base64() {
		let signal = DeviceSignal::decode("output", json!({"pid": 7, "fd": 1, "data": "aGk="}), &ctx()).unwrap();
		match signal {
			DeviceSignal::Output { pid, fd, data } => {
				assert_eq!((pid, fd), (7, 1));
				assert_eq!(data, b"hi");
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn payload_handles_are_borrowed() {
		let signal = ManagerSignal::decode(
			"added",
			json!({"device": {"handle": 5, "id": "usb-1", "name": "Phone", "type": "usb"}}),
			&ctx(),
		)
		.unwrap();
		let ManagerSignal::Added(device) = signal else {
			panic!("expected added");
		};
		assert_eq!(device.id(), "usb-1");
		assert_eq!(device.handle_kind(), HandleKind::Borrowed);
	}

	#[test]
	fn detached_without_crash() {
		let signal =
			SessionSignal::decode("detached", json!({"reason": "process-terminated", "crash": null}), &ctx()).unwrap();
		let SessionSignal::Detached { reason, crash } = signal;
		assert_eq!(reason, SessionDetachReason::ProcessTerminated);
		assert!(crash.is_none());
	}

	#[test]
	fn malformed_payload_is_a_protocol_error() {
		let err = PortalSignal::decode("subscribe", json!({}), &ctx()).unwrap_err();
		assert!(matches!(err, Error::Protocol(_)), "{err:?}");
	}

	#[tokio::test]
	async fn bridge_rejects_unknown_names_and_tracks_handlers() {
		let ctx = ctx();
		let channel = ctx.channel(3, HandleKind::Object, "script");
		let bridge: SignalBridge<ScriptSignal> = SignalBridge::new(&ctx, &channel);

		let err = bridge.on(&channel, "exploded", |_| {}).unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");

		let first = bridge.on(&channel, "message", |_| {}).unwrap();
		let second = bridge.on(&channel, "message", |_| {}).unwrap();
		assert_eq!(bridge.handler_count(), 2);
		drop(first);
		second.unsubscribe();
		assert_eq!(bridge.handler_count(), 0);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn connect_and_disconnect_stay_paired_under_contention() {
		let (client, mut engine) = memory_pair();
		let connection = Arc::new(Connection::new(client));
		let runner = Arc::clone(&connection);
		tokio::spawn(async move { runner.run().await });

		let ctx = Context::new(connection, Arc::new(Config::default()));
		let channel = ctx.channel(3, HandleKind::Object, "script");
		let bridge: SignalBridge<ScriptSignal> = SignalBridge::new(&ctx, &channel);
		// starts the consumer task while a runtime is current
		drop(bridge.on(&channel, "message", |_| {}).unwrap());

		std::thread::scope(|scope| {
			for _ in 0..4 {
				scope.spawn(|| {
					for _ in 0..200 {
						drop(bridge.on(&channel, "message", |_| {}).unwrap());
					}
				});
			}
		});
		let _kept = bridge.on(&channel, "message", |_| {}).unwrap();

		let mut connected = false;
		while let Ok(Some(value)) = tokio::time::timeout(Duration::from_millis(200), engine.message_rx.recv()).await {
			match value["method"].as_str() {
				Some(CONNECT) => {
					assert!(!connected, "connected twice in a row");
					connected = true;
				}
				Some(DISCONNECT) => {
					assert!(connected, "disconnected while not connected");
					connected = false;
				}
				_ => {}
			}
		}
		assert!(connected, "a live handler has no engine-side subscription");
	}

	#[tokio::test]
	async fn bridge_refuses_released_objects() {
		let ctx = ctx();
		let channel = ctx.channel(3, HandleKind::Object, "script");
		let bridge: SignalBridge<ScriptSignal> = SignalBridge::new(&ctx, &channel);
		channel.release();

		let err = bridge.on(&channel, "destroyed", |_| {}).unwrap_err();
		assert!(matches!(err, Error::NilHandle { kind: "script" }));
	}

	#[test]
	fn names_round_trip_through_decode() {
		for name in CompilerSignal::NAMES {
			let params = transform::<CompilerSignal>(name, json!({"bundle": "b", "text": "t"}));
			let signal = CompilerSignal::decode(name, params, &ctx()).unwrap();
			assert_eq!(signal.name(), *name);
		}
	}
}

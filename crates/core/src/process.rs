//! Read-only value handles returned by device queries and signals.
//!
//! Each wraps the descriptor the engine sent along with the reference, so
//! accessors never cross the boundary and keep working after the list the
//! value came from has been released.

use serde_json::{Map, Value};
use telco_protocol::{
	ApplicationDescriptor, ChildDescriptor, ChildOrigin, CrashDescriptor, Icon, ProcessDescriptor, SpawnDescriptor,
};
use telco_runtime::{Handle, HandleKind};

use crate::context::Context;

macro_rules! value_handle {
	($(#[$meta:meta])* $name:ident, $desc:ty) => {
		$(#[$meta])*
		#[derive(Debug)]
		pub struct $name {
			handle: Handle,
			desc: $desc,
		}

		impl $name {
			pub(crate) fn adopt(ctx: &Context, desc: $desc, kind: HandleKind) -> Self {
				Self {
					handle: ctx.handle(desc.handle, kind),
					desc,
				}
			}

			/// The descriptor as the engine reported it.
			pub fn descriptor(&self) -> &$desc {
				&self.desc
			}

			pub fn is_released(&self) -> bool {
				self.handle.is_released()
			}

			/// Gives the engine reference back. Borrowed values release nothing.
			pub fn release(self) {
				self.handle.release();
			}
		}
	};
}

fn icons(parameters: &Map<String, Value>) -> Vec<Icon> {
	parameters
		.get("icons")
		.cloned()
		.and_then(|v| serde_json::from_value(v).ok())
		.unwrap_or_default()
}

value_handle!(
	/// A running process.
	Process,
	ProcessDescriptor
);

impl Process {
	pub fn pid(&self) -> u32 {
		self.desc.pid
	}

	pub fn name(&self) -> &str {
		&self.desc.name
	}

	/// Extra metadata; only populated above [`Scope::Minimal`](telco_protocol::Scope::Minimal).
	pub fn parameters(&self) -> &Map<String, Value> {
		&self.desc.parameters
	}

	/// Icons, present with [`Scope::Full`](telco_protocol::Scope::Full).
	pub fn icons(&self) -> Vec<Icon> {
		icons(&self.desc.parameters)
	}
}

value_handle!(
	/// An installed application, running or not.
	Application,
	ApplicationDescriptor
);

impl Application {
	pub fn identifier(&self) -> &str {
		&self.desc.identifier
	}

	pub fn name(&self) -> &str {
		&self.desc.name
	}

	/// Pid of the running instance, `0` when not running.
	pub fn pid(&self) -> u32 {
		self.desc.pid
	}

	pub fn is_running(&self) -> bool {
		self.desc.pid != 0
	}

	pub fn parameters(&self) -> &Map<String, Value> {
		&self.desc.parameters
	}

	pub fn icons(&self) -> Vec<Icon> {
		icons(&self.desc.parameters)
	}
}

value_handle!(
	/// A process held suspended by spawn gating or an explicit spawn.
	Spawn,
	SpawnDescriptor
);

impl Spawn {
	pub fn pid(&self) -> u32 {
		self.desc.pid
	}

	pub fn identifier(&self) -> Option<&str> {
		self.desc.identifier.as_deref()
	}
}

value_handle!(
	/// A process created by an instrumented target.
	Child,
	ChildDescriptor
);

impl Child {
	pub fn pid(&self) -> u32 {
		self.desc.pid
	}

	pub fn parent_pid(&self) -> u32 {
		self.desc.parent_pid
	}

	pub fn origin(&self) -> ChildOrigin {
		self.desc.origin
	}

	pub fn identifier(&self) -> Option<&str> {
		self.desc.identifier.as_deref()
	}

	pub fn path(&self) -> Option<&str> {
		self.desc.path.as_deref()
	}

	pub fn argv(&self) -> Option<&[String]> {
		self.desc.argv.as_deref()
	}

	pub fn envp(&self) -> Option<&[String]> {
		self.desc.envp.as_deref()
	}
}

value_handle!(
	/// Crash report for a process that died under instrumentation.
	Crash,
	CrashDescriptor
);

impl Crash {
	pub fn pid(&self) -> u32 {
		self.desc.pid
	}

	pub fn process_name(&self) -> &str {
		&self.desc.process_name
	}

	pub fn summary(&self) -> &str {
		&self.desc.summary
	}

	pub fn report(&self) -> &str {
		&self.desc.report
	}

	pub fn parameters(&self) -> &Map<String, Value> {
		&self.desc.parameters
	}
}

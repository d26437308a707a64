//! Owned references to engine objects.
//!
//! A [`Handle`] is the single owner of one engine reference. The release
//! strategy is fixed by its [`HandleKind`] at construction. Release is
//! idempotent and infallible, and dropping a handle releases it if nobody
//! did so explicitly.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use telco_protocol::{HandleId, NIL_HANDLE};

use crate::connection::{CLOSE, ConnectionLike, UNREF};
use crate::error::{Error, Result};

/// How the engine expects a handle to be given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
	/// Reference-counted engine object, released with `__unref__`.
	Object,
	/// Engine stream, released with `__close__`.
	Stream,
	/// Engine-owned for the duration of a signal delivery; nothing to release.
	Borrowed,
}

impl HandleKind {
	fn release_method(self) -> Option<&'static str> {
		match self {
			HandleKind::Object => Some(UNREF),
			HandleKind::Stream => Some(CLOSE),
			HandleKind::Borrowed => None,
		}
	}
}

pub struct Handle {
	id: HandleId,
	kind: HandleKind,
	released: AtomicBool,
	connection: Arc<dyn ConnectionLike>,
}

impl Handle {
	pub fn new(connection: Arc<dyn ConnectionLike>, id: HandleId, kind: HandleKind) -> Self {
		Self {
			id,
			kind,
			released: AtomicBool::new(false),
			connection,
		}
	}

	pub fn nil(connection: Arc<dyn ConnectionLike>) -> Self {
		Self::new(connection, NIL_HANDLE, HandleKind::Borrowed)
	}

	pub fn id(&self) -> HandleId {
		self.id
	}

	pub fn kind(&self) -> HandleKind {
		self.kind
	}

	pub fn is_nil(&self) -> bool {
		self.id == NIL_HANDLE
	}

	pub fn is_released(&self) -> bool {
		self.released.load(Ordering::Acquire)
	}

	/// The id to address, or `NilHandle` if this handle may not be used.
	pub fn live_id(&self, kind: &'static str) -> Result<HandleId> {
		if self.is_nil() || self.is_released() {
			return Err(Error::NilHandle { kind });
		}
		Ok(self.id)
	}

	pub fn connection(&self) -> &Arc<dyn ConnectionLike> {
		&self.connection
	}

	/// Gives the reference back to the engine. Second and later calls, and
	/// calls on nil handles, do nothing.
	pub fn release(&self) {
		if self.is_nil() || self.released.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(method) = self.kind.release_method() {
			tracing::trace!(handle = self.id, method, "release");
			self.connection.notify(self.id, method, Value::Null);
		}
	}

	/// Marks the handle released without telling the engine, for references
	/// the engine has already given up (a stream closed by request).
	pub fn disarm(&self) {
		self.released.store(true, Ordering::Release);
	}
}

impl Drop for Handle {
	fn drop(&mut self) {
		self.release();
	}
}

impl fmt::Debug for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handle")
			.field("id", &self.id)
			.field("kind", &self.kind)
			.field("released", &self.is_released())
			.finish()
	}
}

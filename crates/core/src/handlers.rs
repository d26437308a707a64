//! Callback storage for signal subscriptions.
//!
//! Handlers live in an [`IndexMap`] so removal is O(1) and iteration follows
//! subscription order, which is the order callbacks are invoked in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Unique identifier for signal handlers.
pub type HandlerId = u64;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a new globally-unique handler ID.
pub fn next_handler_id() -> HandlerId {
	NEXT_HANDLER_ID.fetch_add(1, Ordering::SeqCst)
}

/// Callback receiving a decoded signal by reference.
pub type HandlerFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handler entry with metadata `M` (the wire name it listens for).
pub struct HandlerEntry<E, M = ()> {
	pub id: HandlerId,
	pub meta: M,
	pub handler: HandlerFn<E>,
}

impl<E, M: Clone> Clone for HandlerEntry<E, M> {
	fn clone(&self) -> Self {
		Self {
			id: self.id,
			meta: self.meta.clone(),
			handler: Arc::clone(&self.handler),
		}
	}
}

pub type HandlerMap<E, M = ()> = Arc<Mutex<IndexMap<HandlerId, HandlerEntry<E, M>>>>;

/// RAII guard that unregisters a handler on drop.
///
/// Holds only a weak reference to the owner's state, so dropping it after the
/// owning object is gone is a no-op.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
	id: HandlerId,
	dropper: Option<Arc<dyn Fn(HandlerId) + Send + Sync>>,
}

impl Subscription {
	pub fn new(id: HandlerId, dropper: Arc<dyn Fn(HandlerId) + Send + Sync>) -> Self {
		Self {
			id,
			dropper: Some(dropper),
		}
	}

	/// Creates a subscription that removes `id` from `handlers` and then runs
	/// `after` with the removed entry's metadata and the remaining handlers.
	///
	/// `after` runs while the map is still locked, so it sees the same state
	/// a concurrent subscriber will.
	pub fn from_handler_map<E, M, F>(id: HandlerId, handlers: &HandlerMap<E, M>, after: F) -> Self
	where
		E: Send + Sync + 'static,
		M: Send + Sync + 'static,
		F: Fn(&M, &IndexMap<HandlerId, HandlerEntry<E, M>>) + Send + Sync + 'static,
	{
		let weak: Weak<Mutex<IndexMap<HandlerId, HandlerEntry<E, M>>>> = Arc::downgrade(handlers);
		let dropper = Arc::new(move |id: HandlerId| {
			let Some(map) = weak.upgrade() else {
				return;
			};
			let mut map = map.lock();
			if let Some(entry) = map.shift_remove(&id) {
				after(&entry.meta, &map);
			}
		});
		Self::new(id, dropper)
	}

	pub fn id(&self) -> HandlerId {
		self.id
	}

	/// Explicitly unsubscribes. Equivalent to dropping.
	pub fn unsubscribe(mut self) {
		if let Some(dropper) = self.dropper.take() {
			(dropper)(self.id);
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(dropper) = self.dropper.take() {
			(dropper)(self.id);
		}
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("id", &self.id)
			.field("active", &self.dropper.is_some())
			.finish()
	}
}

//! Per-object signal routing.
//!
//! Each subscriber owns a FIFO fed by the dispatch loop. Events for one
//! handle are pushed in arrival order, so a single consumer per FIFO sees them
//! in the order the engine emitted them. A receiver removes its own FIFO when
//! dropped, so released objects leave nothing behind in the table.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use telco_protocol::HandleId;
use tokio::sync::mpsc;

use super::Event;

struct Sink {
	tx: mpsc::UnboundedSender<Event>,
	pending: Arc<AtomicUsize>,
}

type SinkTable = DashMap<HandleId, Vec<Sink>>;

/// Drops closed FIFOs for `handle`, and the entry itself once none are left.
fn prune(sinks: &SinkTable, handle: HandleId) {
	if let Some(mut open) = sinks.get_mut(&handle) {
		open.retain(|sink| !sink.tx.is_closed());
	}
	sinks.remove_if(&handle, |_, open| open.is_empty());
}

/// Consumer end of one signal FIFO.
pub struct SignalReceiver {
	handle: HandleId,
	rx: mpsc::UnboundedReceiver<Event>,
	pending: Arc<AtomicUsize>,
	table: Weak<SinkTable>,
}

impl SignalReceiver {
	/// Waits for the next event. Returns `None` once the connection is gone.
	pub async fn recv(&mut self) -> Option<Event> {
		let event = self.rx.recv().await?;
		self.pending.fetch_sub(1, Ordering::Relaxed);
		Some(event)
	}

	pub fn handle(&self) -> HandleId {
		self.handle
	}

	/// Events queued but not yet consumed.
	pub fn pending(&self) -> usize {
		self.pending.load(Ordering::Relaxed)
	}

	/// A receiver that never yields, for objects with no live handle.
	pub fn closed(handle: HandleId) -> Self {
		let (_, rx) = mpsc::unbounded_channel();
		Self {
			handle,
			rx,
			pending: Arc::new(AtomicUsize::new(0)),
			table: Weak::new(),
		}
	}
}

impl Drop for SignalReceiver {
	fn drop(&mut self) {
		self.rx.close();
		if let Some(table) = self.table.upgrade() {
			prune(&table, self.handle);
		}
	}
}

/// Thread-safe table of signal FIFOs by handle.
pub struct SignalRoutes {
	sinks: Arc<SinkTable>,
	warn_at: usize,
}

impl SignalRoutes {
	pub fn new(warn_at: usize) -> Self {
		Self {
			sinks: Arc::new(DashMap::new()),
			warn_at,
		}
	}

	/// Opens a new FIFO for events addressed to `handle`.
	pub fn register(&self, handle: HandleId) -> SignalReceiver {
		let (tx, rx) = mpsc::unbounded_channel();
		let pending = Arc::new(AtomicUsize::new(0));
		self.sinks.entry(handle).or_default().push(Sink {
			tx,
			pending: Arc::clone(&pending),
		});
		SignalReceiver {
			handle,
			rx,
			pending,
			table: Arc::downgrade(&self.sinks),
		}
	}

	/// Fans `event` out to every open FIFO for its handle. Returns how many
	/// subscribers received it.
	pub fn route(&self, event: Event) -> usize {
		let handle = event.handle;
		let Some(mut sinks) = self.sinks.get_mut(&handle) else {
			return 0;
		};

		sinks.retain(|sink| {
			if sink.tx.send(event.clone()).is_err() {
				return false;
			}
			let queued = sink.pending.fetch_add(1, Ordering::Relaxed) + 1;
			if self.warn_at > 0 && queued == self.warn_at {
				tracing::warn!(handle, signal = %event.signal, queued, "signal consumer is falling behind");
			}
			true
		});
		let delivered = sinks.len();
		let empty = sinks.is_empty();
		drop(sinks);

		if empty {
			self.sinks.remove_if(&handle, |_, v| v.is_empty());
		}
		delivered
	}

	/// Drops every FIFO; consumers observe end-of-stream.
	pub fn clear(&self) {
		self.sinks.clear();
	}

	pub fn len(&self) -> usize {
		self.sinks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sinks.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn event(handle: HandleId, signal: &str) -> Event {
		Event {
			handle,
			signal: signal.to_string(),
			params: json!({}),
		}
	}

	#[tokio::test]
	async fn events_fan_out_in_order() {
		let routes = SignalRoutes::new(0);
		let mut a = routes.register(4);
		let mut b = routes.register(4);

		assert_eq!(routes.route(event(4, "spawn_added")), 2);
		assert_eq!(routes.route(event(4, "lost")), 2);
		assert_eq!(a.pending(), 2);

		assert_eq!(a.recv().await.unwrap().signal, "spawn_added");
		assert_eq!(a.recv().await.unwrap().signal, "lost");
		assert_eq!(b.recv().await.unwrap().signal, "spawn_added");
		assert_eq!(a.pending(), 0);
	}

	#[test]
	fn other_handles_are_not_delivered() {
		let routes = SignalRoutes::new(0);
		let _a = routes.register(4);
		assert_eq!(routes.route(event(5, "lost")), 0);
	}

	#[test]
	fn dropped_receivers_leave_no_routes() {
		let routes = SignalRoutes::new(0);
		let receivers: Vec<_> = (1..=10).map(|handle| routes.register(handle)).collect();
		assert_eq!(routes.len(), 10);

		drop(receivers);
		assert!(routes.is_empty());
		assert_eq!(routes.route(event(4, "lost")), 0);
	}

	#[test]
	fn dropping_one_receiver_keeps_the_others() {
		let routes = SignalRoutes::new(0);
		let a = routes.register(4);
		let _b = routes.register(4);

		drop(a);
		assert_eq!(routes.len(), 1);
		assert_eq!(routes.route(event(4, "lost")), 1);
	}
}

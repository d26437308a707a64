// Shared harness: a client connected to a fresh in-process engine.

#![allow(dead_code)]

use std::time::Duration;

use telco::{Config, Telco};
use telco_sim::Simulator;
use tokio::sync::mpsc;

pub async fn setup() -> (Telco, Simulator) {
	setup_with(Config::default()).await
}

pub async fn setup_with(config: Config) -> (Telco, Simulator) {
	let sim = Simulator::new();
	let telco = Telco::connect(sim.connect(), config);
	(telco, sim)
}

/// Channel for moving values out of signal callbacks.
pub fn events<T>() -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<T>) {
	mpsc::unbounded_channel()
}

/// Next value out of a callback, failing the test after two seconds.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
	tokio::time::timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("timed out waiting for a signal")
		.expect("signal channel closed")
}

/// Asserts nothing else arrives within a short grace period.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
	tokio::time::sleep(Duration::from_millis(100)).await;
	if let Ok(extra) = rx.try_recv() {
		panic!("unexpected extra signal: {extra:?}");
	}
}

/// One round trip. The engine handles messages in order, so every release
/// and subscription sent before this has been processed once it returns.
pub async fn settle(telco: &Telco) {
	telco.version().await.expect("version round trip");
}

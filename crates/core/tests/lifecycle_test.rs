// Handle lifecycle tests
//
// Release idempotence, list/element independence and connection teardown,
// checked against the engine's own count of outstanding references.

mod common;

use std::time::Duration;

use common::{events, next, settle, setup};
use telco::{Error, ErrorCode, ManagerSignal, ProcessQueryOptions, Scope};

#[tokio::test]
async fn test_release_then_drop_sends_one_unref() {
	let (telco, sim) = setup().await;

	let manager = telco.device_manager().await.unwrap();
	let device = manager.local_device().await.unwrap();
	let init = device.process_by_pid(1, Scope::Minimal).await.unwrap();
	settle(&telco).await;
	assert_eq!(sim.live_handles(), 3);

	// release(self) releases, then the drop at the end of the call releases again
	init.release();
	device.release();
	manager.release();
	settle(&telco).await;

	assert_eq!(sim.live_handles(), 0);
	assert_eq!(sim.stale_releases(), 0, "a handle was released twice on the wire");
}

#[tokio::test]
async fn test_failed_close_leaves_manager_open() {
	let (telco, sim) = setup().await;
	let manager = telco.device_manager().await.unwrap();

	sim.fail_next("close", ErrorCode::InvalidOperation, "registry is busy");
	let err = manager.close().await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidOperation));
	assert!(!manager.is_closed());
	assert_eq!(manager.enumerate_devices().await.unwrap().len(), 1);

	manager.close().await.unwrap();
	assert!(manager.is_closed());
}

#[tokio::test]
async fn test_closing_manager_twice_is_a_no_op() {
	let (telco, sim) = setup().await;
	let manager = telco.device_manager().await.unwrap();

	manager.close().await.unwrap();
	manager.close().await.unwrap();
	assert!(manager.is_closed());

	let err = manager.enumerate_devices().await.unwrap_err();
	assert!(matches!(err, Error::Closed { .. }), "got {err:?}");

	drop(manager);
	settle(&telco).await;
	assert_eq!(sim.live_handles(), 0);
	assert_eq!(sim.stale_releases(), 0);
}

#[tokio::test]
async fn test_borrowed_signal_payloads_are_never_released() {
	let (telco, sim) = setup().await;
	let manager = telco.device_manager().await.unwrap();

	let (tx, mut rx) = events();
	let _sub = manager
		.on("added", move |signal| {
			if let ManagerSignal::Added(device) = signal {
				let _ = tx.send(device.id().to_string());
			}
		})
		.unwrap();
	settle(&telco).await;

	sim.add_device("usb-1", "Pixel", telco::DeviceType::Usb).unwrap();
	assert_eq!(next(&mut rx).await, "usb-1");

	settle(&telco).await;
	assert_eq!(sim.live_handles(), 1, "only the manager is held");
	assert_eq!(sim.stale_releases(), 0);
}

#[tokio::test]
async fn test_released_list_keeps_elements_valid() {
	let (telco, sim) = setup().await;
	sim.add_process("local", 300, "sshd").unwrap();
	sim.add_process("local", 4242, "notes").unwrap();

	let manager = telco.device_manager().await.unwrap();
	let device = manager.local_device().await.unwrap();
	let processes = device.enumerate_processes(&ProcessQueryOptions::default()).await.unwrap();

	// the list handle went back right away; the three elements did not
	settle(&telco).await;
	assert_eq!(sim.live_handles(), 2 + 3);

	let names: Vec<(u32, &str)> = processes.iter().map(|p| (p.pid(), p.name())).collect();
	assert_eq!(names, [(1, "init"), (300, "sshd"), (4242, "notes")]);
	assert!(processes.iter().all(|p| !p.is_released()));

	drop(processes);
	settle(&telco).await;
	assert_eq!(sim.live_handles(), 2);
	assert_eq!(sim.stale_releases(), 0);
}

#[tokio::test]
async fn test_released_device_list_keeps_devices_usable() {
	let (telco, sim) = setup().await;
	sim.add_device("usb-1", "Pixel", telco::DeviceType::Usb).unwrap();

	let manager = telco.device_manager().await.unwrap();
	let devices = manager.enumerate_devices().await.unwrap();
	let ids: Vec<&str> = devices.iter().map(|d| d.id()).collect();
	assert_eq!(ids, ["local", "usb-1"]);

	// elements still cross the boundary after the list is gone
	for device in &devices {
		assert!(!device.is_lost().await.unwrap());
	}
}

#[tokio::test]
async fn test_engine_exit_fails_later_calls() {
	let (telco, sim) = setup().await;
	assert_eq!(telco.version().await.unwrap(), sim.version());

	sim.disconnect_all();
	tokio::time::timeout(Duration::from_secs(2), async {
		while !telco.is_closed() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("connection never noticed the engine leaving");

	let err = telco.device_manager().await.unwrap_err();
	assert!(matches!(err, Error::ChannelClosed), "got {err:?}");
}

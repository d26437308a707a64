// Portal service tests
//
// Tag bookkeeping and message routing, membership lifecycle and the
// connection signals a running portal reports.

mod common;

use common::{events, next, settle, setup};
use serde_json::json;
use telco::{EndpointParameters, ErrorCode, PortalOptions, PortalSignal, SessionOptions};
use telco_sim::Delivery;

const CLUSTER_PORT: u16 = 27052;
const CONTROL_PORT: u16 = 27042;

fn cluster() -> EndpointParameters {
	EndpointParameters::new("127.0.0.1", CLUSTER_PORT)
}

fn control() -> EndpointParameters {
	EndpointParameters::new("::1", CONTROL_PORT).token("hunter2")
}

#[tokio::test]
async fn test_narrowcast_follows_tags() {
	let (telco, sim) = setup().await;
	let portal = telco.portal(cluster(), Some(control())).await.unwrap();
	portal.start().await.unwrap();

	let conn = sim.portal_connect_controller(CONTROL_PORT, "10.0.0.9:51234").unwrap();
	portal.tag_connection(conn, "B").await.unwrap();
	portal.tag_connection(conn, "A").await.unwrap();
	portal.untag_connection(conn, "A").await.unwrap();
	assert_eq!(portal.enumerate_tags(conn).await.unwrap(), ["B"]);

	portal.narrowcast("A", Some(r#"{"to":"A"}"#), None).await.unwrap();
	assert!(sim.delivered(CONTROL_PORT).is_empty());

	portal.narrowcast("B", Some(r#"{"to":"B"}"#), Some(b"\x2a")).await.unwrap();
	assert_eq!(
		sim.delivered(CONTROL_PORT),
		[Delivery {
			connection_id: conn,
			json: Some(r#"{"to":"B"}"#.to_string()),
			data: Some(vec![0x2a]),
		}]
	);
}

#[tokio::test]
async fn test_payload_only_messages() {
	let (telco, sim) = setup().await;
	let portal = telco.portal(cluster(), Some(control())).await.unwrap();
	portal.start().await.unwrap();

	let first = sim.portal_connect_controller(CONTROL_PORT, "10.0.0.9:51234").unwrap();
	let second = sim.portal_connect_controller(CONTROL_PORT, "10.0.0.10:51234").unwrap();
	let _node = sim.portal_connect_node(CLUSTER_PORT, "10.0.0.2:40000").unwrap();

	portal.post(first, None, Some(b"\x01\x02")).await.unwrap();
	portal.broadcast(None, Some(b"\xff")).await.unwrap();

	let raw = |connection_id, bytes: &[u8]| Delivery {
		connection_id,
		json: None,
		data: Some(bytes.to_vec()),
	};
	assert_eq!(
		sim.delivered(CONTROL_PORT),
		[raw(first, b"\x01\x02"), raw(first, b"\xff"), raw(second, b"\xff")]
	);
}

#[tokio::test]
async fn test_tags_are_sorted_and_deduplicated() {
	let (telco, sim) = setup().await;
	let portal = telco.portal(cluster(), None).await.unwrap();
	portal.start().await.unwrap();

	let conn = sim.portal_connect_node(CLUSTER_PORT, "10.0.0.2:40000").unwrap();
	for tag in ["zeta", "alpha", "zeta", "mid"] {
		portal.tag_connection(conn, tag).await.unwrap();
	}
	assert_eq!(portal.enumerate_tags(conn).await.unwrap(), ["alpha", "mid", "zeta"]);
	assert!(portal.enumerate_tags(conn + 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_membership_joins_and_leaves() {
	let (telco, sim) = setup().await;
	sim.add_process("local", 4242, "notes").unwrap();

	let portal = telco.portal(cluster(), None).await.unwrap();
	assert_eq!(portal.cluster_params().port, CLUSTER_PORT);
	assert!(portal.control_params().is_none());

	let (tx, mut rx) = events();
	let mut subs = Vec::new();
	for name in ["node_connected", "node_joined", "node_left", "node_disconnected"] {
		let tx = tx.clone();
		subs.push(
			portal
				.on(name, move |signal| {
					let summary = match signal {
						PortalSignal::NodeConnected { connection_id, .. } => ("connected", *connection_id, None),
						PortalSignal::NodeJoined {
							connection_id,
							application,
						} => ("joined", *connection_id, Some(application.pid())),
						PortalSignal::NodeLeft {
							connection_id,
							application,
						} => ("left", *connection_id, Some(application.pid())),
						PortalSignal::NodeDisconnected { connection_id, .. } => ("disconnected", *connection_id, None),
						_ => return,
					};
					let _ = tx.send(summary);
				})
				.unwrap(),
		);
	}
	portal.start().await.unwrap();

	let device = telco.device_manager().await.unwrap().local_device().await.unwrap();
	let session = device.attach(4242u32, SessionOptions::default()).await.unwrap();
	let membership = session
		.join_portal(&format!("127.0.0.1:{CLUSTER_PORT}"), PortalOptions::new().token("hunter2"))
		.await
		.unwrap();
	let id = membership.id();

	assert_eq!(next(&mut rx).await, ("connected", id, None));
	assert_eq!(next(&mut rx).await, ("joined", id, Some(4242)));

	membership.terminate().await.unwrap();
	assert_eq!(next(&mut rx).await, ("left", id, Some(4242)));
	assert_eq!(next(&mut rx).await, ("disconnected", id, None));

	// a second terminate is a no-op
	membership.terminate().await.unwrap();
	membership.release();

	settle(&telco).await;
	assert_eq!(sim.stale_releases(), 0);
}

#[tokio::test]
async fn test_joining_a_portal_nobody_runs_fails() {
	let (telco, sim) = setup().await;
	sim.add_process("local", 4242, "notes").unwrap();
	let device = telco.device_manager().await.unwrap().local_device().await.unwrap();
	let session = device.attach(4242u32, SessionOptions::default()).await.unwrap();

	let err = session
		.join_portal("127.0.0.1:9", PortalOptions::new())
		.await
		.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::ServerNotRunning));
}

#[tokio::test]
async fn test_second_portal_on_a_port_is_refused() {
	let (telco, _sim) = setup().await;
	let first = telco.portal(cluster(), None).await.unwrap();
	first.start().await.unwrap();

	let second = telco.portal(cluster(), None).await.unwrap();
	let err = second.start().await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::AddressInUse));

	first.stop().await.unwrap();
	second.start().await.unwrap();
}

#[tokio::test]
async fn test_controller_traffic() {
	let (telco, sim) = setup().await;
	let portal = telco.portal(cluster(), Some(control())).await.unwrap();

	let (tx, mut rx) = events();
	let mut subs = Vec::new();
	for name in ["controller_connected", "authenticated", "subscribe", "message", "controller_disconnected"] {
		let tx = tx.clone();
		subs.push(
			portal
				.on(name, move |signal| {
					let summary = match signal {
						PortalSignal::ControllerConnected { remote_address, .. } => format!("connected {remote_address}"),
						PortalSignal::Authenticated { session_info, .. } => format!("authenticated {session_info}"),
						PortalSignal::Subscribe { connection_id } => format!("subscribe {connection_id}"),
						PortalSignal::Message { json, data, .. } => format!("message {json} {data:?}"),
						PortalSignal::ControllerDisconnected { .. } => "disconnected".to_string(),
						_ => return,
					};
					let _ = tx.send(summary);
				})
				.unwrap(),
		);
	}
	portal.start().await.unwrap();

	let conn = sim.portal_connect_controller(CONTROL_PORT, "10.0.0.9:51234").unwrap();
	assert_eq!(next(&mut rx).await, "connected 10.0.0.9:51234");

	sim.portal_authenticate(CONTROL_PORT, conn, json!({ "user": "ops" })).unwrap();
	assert_eq!(next(&mut rx).await, r#"authenticated {"user":"ops"}"#);

	sim.portal_subscribe(CONTROL_PORT, conn).unwrap();
	assert_eq!(next(&mut rx).await, format!("subscribe {conn}"));

	sim.portal_message(CONTROL_PORT, conn, r#"{"cmd":"status"}"#, Some(b"\x01")).unwrap();
	assert_eq!(next(&mut rx).await, r#"message {"cmd":"status"} Some([1])"#);

	portal.post(conn, Some(r#"{"status":"ok"}"#), None).await.unwrap();
	portal.broadcast(Some(r#"{"hello":"all"}"#), None).await.unwrap();
	let delivered = sim.delivered(CONTROL_PORT);
	assert_eq!(delivered.len(), 2);
	assert!(delivered.iter().all(|d| d.connection_id == conn));
	assert_eq!(delivered[1].json.as_deref(), Some(r#"{"hello":"all"}"#));

	portal.kick(conn).await.unwrap();
	assert_eq!(next(&mut rx).await, "disconnected");

	let err = portal.post(conn, Some("not json"), None).await.unwrap_err();
	assert!(err.is_local(), "got {err:?}");
}

#[tokio::test]
async fn test_portal_has_its_own_hidden_device() {
	let (telco, _sim) = setup().await;
	let portal = telco.portal(cluster(), None).await.unwrap();
	let device = portal.device().await.unwrap();
	assert_eq!(device.id(), format!("portal-{CLUSTER_PORT}"));

	let listed = telco.device_manager().await.unwrap().enumerate_devices().await.unwrap();
	assert!(listed.iter().all(|d| d.id() != device.id()));
}

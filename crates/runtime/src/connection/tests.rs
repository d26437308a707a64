use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::transport::memory_pair;

fn create_test_connection() -> (Connection, TransportParts) {
	let (client, engine) = memory_pair();
	(Connection::new(client), engine)
}

#[test]
fn request_ids_increment() {
	let (connection, _engine) = create_test_connection();

	let id1 = connection.last_id.fetch_add(1, Ordering::SeqCst);
	let id2 = connection.last_id.fetch_add(1, Ordering::SeqCst);

	assert_eq!(id2, id1 + 1);
}

#[test]
fn request_wire_shape() {
	let request = Request {
		id: 3,
		handle: 12,
		method: "enumerate_processes".to_string(),
		params: json!({"scope": "minimal"}),
	};
	assert_eq!(
		serde_json::to_value(&request).unwrap(),
		json!({"id": 3, "handle": 12, "method": "enumerate_processes", "params": {"scope": "minimal"}})
	);
}

#[tokio::test]
async fn dispatch_response_success() {
	let (connection, _engine) = create_test_connection();

	let (tx, rx) = oneshot::channel();
	connection.callbacks.lock().await.insert(7, tx);

	connection
		.dispatch(Message::Response(Response {
			id: 7,
			result: Some(json!({"pid": 1234})),
			error: None,
		}))
		.await
		.unwrap();

	assert_eq!(rx.await.unwrap().unwrap()["pid"], 1234);
}

#[tokio::test]
async fn dispatch_response_error_keeps_code_and_message() {
	let (connection, _engine) = create_test_connection();

	let (tx, rx) = oneshot::channel();
	connection.callbacks.lock().await.insert(8, tx);

	connection
		.dispatch(Message::Response(Response {
			id: 8,
			result: None,
			error: Some(ErrorPayload {
				code: ErrorCode::TimedOut,
				message: "timed out waiting for device".to_string(),
			}),
		}))
		.await
		.unwrap();

	let err = rx.await.unwrap().unwrap_err();
	assert!(err.is_timeout(), "{err:?}");
	assert_eq!(err.to_string(), "timed-out: timed out waiting for device");
}

#[tokio::test]
async fn response_without_pending_request_is_protocol_error() {
	let (connection, _engine) = create_test_connection();
	let err = connection
		.dispatch(Message::Response(Response {
			id: 99,
			result: None,
			error: None,
		}))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn message_deserialization_distinguishes_response_and_event() {
	let response: Message = serde_json::from_str(r#"{"id": 42, "result": {"ok": true}}"#).unwrap();
	assert!(matches!(response, Message::Response(Response { id: 42, .. })));

	let event: Message = serde_json::from_str(r#"{"handle": 5, "signal": "lost"}"#).unwrap();
	match event {
		Message::Event(event) => {
			assert_eq!(event.handle, 5);
			assert_eq!(event.signal, "lost");
			assert!(event.params.is_null());
		}
		other => panic!("expected event, got {other:?}"),
	}

	let unknown: Message = serde_json::from_str(r#"{"hello": "world"}"#).unwrap();
	assert!(matches!(unknown, Message::Unknown(_)));
}

#[test]
fn inbound_deserialization_distinguishes_request_and_notification() {
	let request: Inbound = serde_json::from_str(r#"{"id": 1, "handle": 0, "method": "version"}"#).unwrap();
	assert!(matches!(request, Inbound::Request(_)));

	let notification: Inbound = serde_json::from_str(r#"{"handle": 4, "method": "__unref__"}"#).unwrap();
	assert!(matches!(notification, Inbound::Notification(_)));
}

#[tokio::test]
async fn round_trip_through_running_connection() {
	let (connection, mut engine) = create_test_connection();
	let connection = Arc::new(connection);
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let engine_task = tokio::spawn(async move {
		let request: Request = serde_json::from_value(engine.message_rx.recv().await.unwrap()).unwrap();
		assert_eq!(request.method, "version");
		engine
			.sender
			.send(json!({"id": request.id, "result": "16.1.4"}))
			.await
			.unwrap();
		engine
	});

	let version = connection.send_message(0, "version", Value::Null).await.unwrap();
	assert_eq!(version, "16.1.4");
	drop(engine_task.await.unwrap());
}

#[tokio::test]
async fn notifications_carry_no_id() {
	let (connection, mut engine) = create_test_connection();
	let connection = Arc::new(connection);
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	connection.notify(6, UNREF, Value::Null);

	let value = engine.message_rx.recv().await.unwrap();
	assert!(value.get("id").is_none());
	assert_eq!(value["handle"], 6);
	assert_eq!(value["method"], UNREF);
}

#[tokio::test]
async fn events_route_to_subscribed_handle() {
	let (connection, mut engine) = create_test_connection();
	let connection = Arc::new(connection);
	let mut signals = connection.subscribe_signals(3);
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	engine
		.sender
		.send(json!({"handle": 9, "signal": "lost"}))
		.await
		.unwrap();
	engine
		.sender
		.send(json!({"handle": 3, "signal": "output", "params": {"pid": 1, "fd": 1, "data": "aGk="}}))
		.await
		.unwrap();

	let event = tokio::time::timeout(Duration::from_secs(1), signals.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(event.signal, "output");
	assert_eq!(event.params["pid"], 1);
}

#[test]
fn dropped_subscribers_release_their_routes() {
	let (connection, _engine) = create_test_connection();
	let receivers: Vec<_> = (1..=10).map(|handle| connection.subscribe_signals(handle)).collect();
	assert_eq!(connection.routes.len(), 10);

	drop(receivers);
	assert_eq!(connection.routes.len(), 0);
}

#[tokio::test]
async fn pending_requests_fail_when_engine_goes_away() {
	let (connection, engine) = create_test_connection();
	let connection = Arc::new(connection);
	let runner = Arc::clone(&connection);
	tokio::spawn(async move { runner.run().await });

	let pending = {
		let connection = Arc::clone(&connection);
		tokio::spawn(async move { connection.send_message(0, "version", Value::Null).await })
	};
	tokio::task::yield_now().await;
	drop(engine);

	let err = tokio::time::timeout(Duration::from_secs(1), pending)
		.await
		.unwrap()
		.unwrap()
		.unwrap_err();
	assert!(matches!(err, Error::ChannelClosed), "{err:?}");
}

// Signal subscription tests
//
// Payload transforms, handler ordering, name validation and the
// connect/disconnect bookkeeping behind `on`.

mod common;

use common::{assert_quiet, events, next, settle, setup};
use serde_json::json;
use telco::{CompilerSignal, Error, ScriptOptions, ScriptSignal, SessionOptions};

#[tokio::test]
async fn test_diagnostics_reach_every_handler_once_in_order() {
	let (telco, sim) = setup().await;
	sim.set_diagnostics("agent.ts", ["TS2304: Cannot find name 'foo'.", "TS1005: ';' expected."]);
	let compiler = telco.compiler().await.unwrap();

	let (tx, mut rx) = events();
	let first_tx = tx.clone();
	let _first = compiler
		.on("diagnostics", move |signal| {
			if let CompilerSignal::Diagnostics(text) = signal {
				let _ = first_tx.send(("first", text.clone()));
			}
		})
		.unwrap();
	let _second = compiler
		.on("diagnostics", move |signal| {
			if let CompilerSignal::Diagnostics(text) = signal {
				let _ = tx.send(("second", text.clone()));
			}
		})
		.unwrap();

	let bundle = compiler.build("agent.ts").await.unwrap();
	assert!(bundle.contains("agent.ts"));

	let expected = [
		("first", "TS2304: Cannot find name 'foo'."),
		("second", "TS2304: Cannot find name 'foo'."),
		("first", "TS1005: ';' expected."),
		("second", "TS1005: ';' expected."),
	];
	for (handler, text) in expected {
		assert_eq!(next(&mut rx).await, (handler, text.to_string()));
	}
	assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_build_lifecycle_signals() {
	let (telco, _sim) = setup().await;
	let compiler = telco.compiler().await.unwrap();

	let (tx, mut rx) = events();
	let mut subs = Vec::new();
	for name in ["starting", "finished", "output"] {
		let tx = tx.clone();
		subs.push(compiler.on(name, move |signal| drop(tx.send(signal.clone()))).unwrap());
	}

	compiler.build("main.ts").await.unwrap();
	assert_eq!(next(&mut rx).await, CompilerSignal::Starting);
	assert_eq!(next(&mut rx).await, CompilerSignal::Finished);
	// only watch mode streams bundles
	assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_unknown_signal_name_is_rejected() {
	let (telco, sim) = setup().await;
	let compiler = telco.compiler().await.unwrap();

	let err = compiler.on("diagnostic", |_| {}).unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
	assert!(err.to_string().contains("diagnostic"));

	let manager = telco.device_manager().await.unwrap();
	assert!(manager.on("spawn_added", |_| {}).is_err());

	settle(&telco).await;
	assert_eq!(sim.live_handles(), 2);
}

#[tokio::test]
async fn test_dropping_subscription_stops_delivery() {
	let (telco, sim) = setup().await;
	sim.set_diagnostics("a.ts", ["oops"]);
	let compiler = telco.compiler().await.unwrap();

	let (tx, mut rx) = events();
	let keep_tx = tx.clone();
	let kept = compiler
		.on("diagnostics", move |signal| drop(keep_tx.send(("kept", signal.clone()))))
		.unwrap();
	let dropped = compiler
		.on("diagnostics", move |signal| drop(tx.send(("dropped", signal.clone()))))
		.unwrap();

	compiler.build("a.ts").await.unwrap();
	let oops = CompilerSignal::Diagnostics("oops".to_string());
	assert_eq!(next(&mut rx).await, ("kept", oops.clone()));
	assert_eq!(next(&mut rx).await, ("dropped", oops.clone()));

	drop(dropped);
	compiler.build("a.ts").await.unwrap();
	assert_eq!(next(&mut rx).await, ("kept", oops));
	assert_quiet(&mut rx).await;

	// the last handler going away disconnects the signal; nothing is queued after
	kept.unsubscribe();
	compiler.build("a.ts").await.unwrap();
	assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_script_messages_carry_payload_and_data() {
	let (telco, sim) = setup().await;
	sim.add_process("local", 4242, "notes").unwrap();
	let device = telco.device_manager().await.unwrap().local_device().await.unwrap();
	let session = device.attach(4242u32, SessionOptions::default()).await.unwrap();
	let script = session
		.create_script("recv(function (m) { send(m); });", ScriptOptions::new("echo"))
		.await
		.unwrap();

	let (tx, mut rx) = events();
	let _sub = script.on("message", move |signal| drop(tx.send(signal.clone()))).unwrap();
	script.load().await.unwrap();

	script.post(r#"{"kind":"ping"}"#, Some(b"\x00\x01")).await.unwrap();
	let ScriptSignal::Message { message, data } = next(&mut rx).await else {
		panic!("expected a message");
	};
	let message: serde_json::Value = serde_json::from_str(&message).unwrap();
	assert_eq!(message, json!({ "type": "send", "payload": { "kind": "ping" } }));
	assert_eq!(data.as_deref(), Some(&b"\x00\x01"[..]));

	script.post("[1,2]", None).await.unwrap();
	assert!(matches!(next(&mut rx).await, ScriptSignal::Message { data: None, .. }));
}

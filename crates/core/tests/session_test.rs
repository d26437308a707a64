// Session, script and compiler tests

mod common;

use common::{events, next, settle, setup};
use telco::{
	CompilerSignal, Error, ErrorCode, PeerOptions, Realm, ScriptOptions, ScriptRuntime, ScriptSignal,
	SessionDetachReason, SessionOptions, SessionSignal, SnapshotOptions,
};

async fn attached(sim: &telco_sim::Simulator, telco: &telco::Telco, pid: u32) -> telco::Session {
	sim.add_process("local", pid, "notes").unwrap();
	let device = telco.device_manager().await.unwrap().local_device().await.unwrap();
	device
		.attach(pid, SessionOptions::new(Realm::Native, 30))
		.await
		.unwrap()
}

#[tokio::test]
async fn test_script_lifecycle() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 4242).await;
	assert_eq!(session.pid(), 4242);
	assert_eq!(session.persist_timeout(), 30);

	let script = session
		.create_script("send('ready');", ScriptOptions::new("lifecycle"))
		.await
		.unwrap();

	let err = script.post("{}", None).await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidOperation), "post before load");

	script.load().await.unwrap();
	let err = script.load().await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidOperation));

	let err = script.post("{not json", None).await.unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");

	let (tx, mut rx) = events();
	let _sub = script.on("destroyed", move |signal| drop(tx.send(signal.clone()))).unwrap();
	script.unload().await.unwrap();
	assert_eq!(next(&mut rx).await, ScriptSignal::Destroyed);
	assert!(script.is_destroyed().await.unwrap());

	let err = script.load().await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidOperation));
}

#[tokio::test]
async fn test_compiled_script_loads_from_bytes() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 500).await;

	let options = ScriptOptions::new("compiled").runtime(ScriptRuntime::Qjs);
	let code = session.compile_script("send(1 + 1);", options.clone()).await.unwrap();
	assert!(!code.is_empty());

	let script = session.create_script_from_bytes(&code, options).await.unwrap();
	script.load().await.unwrap();

	let err = session
		.create_script_from_bytes(b"send(1)", ScriptOptions::default())
		.await
		.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));

	let err = session
		.create_script_from_bytes(&[], ScriptOptions::default())
		.await
		.unwrap_err();
	assert!(err.is_local(), "empty bytes never reach the engine: {err:?}");
}

#[tokio::test]
async fn test_syntax_errors_come_back_from_the_engine() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 501).await;

	let err = session
		.create_script("send({ broken: [1, 2 }", ScriptOptions::default())
		.await
		.unwrap_err();
	let Error::Engine { code, message } = &err else {
		panic!("expected an engine error, got {err:?}");
	};
	assert_eq!(*code, ErrorCode::InvalidArgument);
	assert!(message.contains("SyntaxError"), "{message}");

	assert!(session.compile_script("'unterminated", ScriptOptions::default()).await.is_err());
}

#[tokio::test]
async fn test_snapshot_feeds_script_options() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 502).await;

	let snapshot = session
		.snapshot_script(
			"globalThis.cache = {};",
			SnapshotOptions::new("cache.ready = true;", ScriptRuntime::V8),
		)
		.await
		.unwrap();
	assert!(!snapshot.is_empty());

	let script = session
		.create_script(
			"send(cache.ready);",
			ScriptOptions::new("warm").snapshot(&snapshot).runtime(ScriptRuntime::V8),
		)
		.await
		.unwrap();
	script.load().await.unwrap();
}

#[tokio::test]
async fn test_detach_reports_reason_and_destroys_scripts() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 503).await;
	let script = session.create_script("1;", ScriptOptions::default()).await.unwrap();
	script.load().await.unwrap();

	let (tx, mut rx) = events();
	let _sub = session
		.on("detached", move |signal| {
			let SessionSignal::Detached { reason, crash } = signal;
			let _ = tx.send((*reason, crash.is_some()));
		})
		.unwrap();
	let (destroyed_tx, mut destroyed_rx) = events();
	let _destroyed = script
		.on("destroyed", move |_| drop(destroyed_tx.send(())))
		.unwrap();

	assert!(!session.is_detached().await.unwrap());
	session.detach().await.unwrap();
	assert_eq!(
		next(&mut rx).await,
		(SessionDetachReason::ApplicationRequested, false)
	);
	next(&mut destroyed_rx).await;
	assert!(session.is_detached().await.unwrap());
	assert!(script.is_destroyed().await.unwrap());
}

#[tokio::test]
async fn test_eternal_scripts_outlive_their_session() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 504).await;
	let script = session.create_script("1;", ScriptOptions::default()).await.unwrap();

	let err = script.eternalize().await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidOperation), "not loaded yet");

	script.load().await.unwrap();
	script.eternalize().await.unwrap();
	session.detach().await.unwrap();
	assert!(!script.is_destroyed().await.unwrap());
}

#[tokio::test]
async fn test_session_control_on_a_live_process() {
	let (telco, sim) = setup().await;
	let session = attached(&sim, &telco, 505).await;

	session.resume().await.unwrap();
	session.enable_child_gating().await.unwrap();
	session.disable_child_gating().await.unwrap();
	session
		.setup_peer_connection(PeerOptions::new().stun_server("stun.example.com:3478"))
		.await
		.unwrap();

	session.detach().await.unwrap();
	let err = session.resume().await.unwrap_err();
	assert_eq!(err.code(), Some(ErrorCode::InvalidOperation));
}

#[tokio::test]
async fn test_watch_rebuilds_on_change() {
	let (telco, sim) = setup().await;
	let compiler = telco.compiler().await.unwrap();

	let (tx, mut rx) = events();
	let mut subs = Vec::new();
	for name in ["file_changed", "output"] {
		let tx = tx.clone();
		subs.push(compiler.on(name, move |signal| drop(tx.send(signal.clone()))).unwrap());
	}

	compiler.watch("agent/index.ts").await.unwrap();
	let CompilerSignal::Output { bundle } = next(&mut rx).await else {
		panic!("expected the initial bundle");
	};
	assert!(bundle.contains("agent/index.ts"));

	settle(&telco).await;
	sim.touch("agent/index.ts");
	assert_eq!(next(&mut rx).await, CompilerSignal::FileChanged);
	assert!(matches!(next(&mut rx).await, CompilerSignal::Output { .. }));

	let err = compiler.build("").await.unwrap_err();
	assert!(matches!(err, Error::InvalidArgument(_)) || err.code() == Some(ErrorCode::InvalidArgument));
}

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, message: &Value) {
	let body = serde_json::to_vec(message).unwrap();
	w.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
	w.write_all(&body).await.unwrap();
	w.flush().await.unwrap();
}

#[tokio::test]
async fn request_is_framed_with_le_length_prefix() {
	let (engine_stdin, client_stdin) = tokio::io::duplex(1024);
	let (client_stdout, _engine_stdout) = tokio::io::duplex(1024);

	let (transport, _rx) = PipeTransport::new(client_stdin, client_stdout);
	let (mut sender, _receiver) = transport.into_parts();

	let request = json!({"id": 1, "handle": 0, "method": "version", "params": null});
	sender.send(request.clone()).await.unwrap();

	let mut engine_stdin = engine_stdin;
	let mut len_buf = [0u8; 4];
	engine_stdin.read_exact(&mut len_buf).await.unwrap();
	let len = u32::from_le_bytes(len_buf) as usize;
	assert_eq!(len, serde_json::to_vec(&request).unwrap().len());

	let mut body = vec![0u8; len];
	engine_stdin.read_exact(&mut body).await.unwrap();
	assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), request);
}

#[tokio::test]
async fn frames_arrive_in_order() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(4096);
	let (client_stdout, mut engine_stdout) = tokio::io::duplex(4096);

	let (mut transport, mut rx) = PipeTransport::new(client_stdin, client_stdout);
	let reader = tokio::spawn(async move { transport.run().await });

	let events = [
		json!({"handle": 3, "signal": "spawn_added", "params": {"spawn": {"handle": 9, "pid": 10}}}),
		json!({"handle": 3, "signal": "spawn_removed", "params": {"spawn": {"handle": 9, "pid": 10}}}),
		json!({"id": 7, "result": null}),
	];
	for event in &events {
		write_frame(&mut engine_stdout, event).await;
	}

	for expected in &events {
		assert_eq!(&rx.recv().await.unwrap(), expected);
	}

	drop(engine_stdout);
	drop(rx);
	let _ = reader.await;
}

#[tokio::test]
async fn large_payload_survives_framing() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(1024 * 1024);
	let (client_stdout, mut engine_stdout) = tokio::io::duplex(1024 * 1024);

	let (mut transport, mut rx) = PipeTransport::new(client_stdin, client_stdout);
	let reader = tokio::spawn(async move { transport.run().await });

	let message = json!({"handle": 5, "signal": "output", "params": {"pid": 1, "fd": 1, "data": "A".repeat(200_000)}});
	write_frame(&mut engine_stdout, &message).await;

	assert_eq!(rx.recv().await.unwrap(), message);

	drop(engine_stdout);
	drop(rx);
	let _ = reader.await;
}

#[tokio::test]
async fn malformed_frame_is_skipped() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(4096);
	let (client_stdout, mut engine_stdout) = tokio::io::duplex(4096);

	let (mut transport, mut rx) = PipeTransport::new(client_stdin, client_stdout);
	let reader = tokio::spawn(async move { transport.run().await });

	let garbage = b"{\"handle\": 3, \"sig";
	engine_stdout.write_all(&(garbage.len() as u32).to_le_bytes()).await.unwrap();
	engine_stdout.write_all(garbage).await.unwrap();
	let event = json!({"handle": 3, "signal": "lost"});
	write_frame(&mut engine_stdout, &event).await;

	assert_eq!(rx.recv().await.unwrap(), event);
	assert!(!reader.is_finished());

	drop(engine_stdout);
	drop(rx);
	let _ = reader.await;
}

#[tokio::test]
async fn truncated_length_prefix_is_an_error() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(1024);
	let (client_stdout, mut engine_stdout) = tokio::io::duplex(1024);

	let (mut transport, _rx) = PipeTransport::new(client_stdin, client_stdout);

	engine_stdout.write_all(&[0x01, 0x02]).await.unwrap();
	drop(engine_stdout);

	let err = transport.run().await.unwrap_err();
	assert!(err.to_string().contains("Failed to read length prefix"), "{err}");
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(1024);
	let (client_stdout, mut engine_stdout) = tokio::io::duplex(1024);

	let (mut transport, _rx) = PipeTransport::new(client_stdin, client_stdout);

	engine_stdout.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
	engine_stdout.flush().await.unwrap();

	let err = transport.run().await.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}

#[tokio::test]
async fn closed_engine_pipe_ends_reader_with_error() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(1024);
	let (client_stdout, engine_stdout) = tokio::io::duplex(1024);

	let (mut transport, _rx) = PipeTransport::new(client_stdin, client_stdout);
	drop(engine_stdout);

	let result = tokio::spawn(async move { transport.run().await }).await.unwrap();
	assert!(result.is_err());
}

#[tokio::test]
async fn dropped_receiver_stops_reader_cleanly() {
	let (_engine_stdin, client_stdin) = tokio::io::duplex(1024);
	let (client_stdout, mut engine_stdout) = tokio::io::duplex(1024);

	let (mut transport, rx) = PipeTransport::new(client_stdin, client_stdout);
	drop(rx);

	write_frame(&mut engine_stdout, &json!({"id": 1, "result": null})).await;

	assert!(transport.run().await.is_ok());
}

#[tokio::test]
async fn memory_pair_is_cross_wired() {
	let (mut client, mut engine) = memory_pair();

	client.sender.send(json!({"id": 1})).await.unwrap();
	engine.sender.send(json!({"id": 1, "result": "ok"})).await.unwrap();

	assert_eq!(engine.message_rx.recv().await.unwrap(), json!({"id": 1}));
	assert_eq!(client.message_rx.recv().await.unwrap(), json!({"id": 1, "result": "ok"}));
	assert!(client.receiver.run().await.is_ok());
}

#[tokio::test]
async fn memory_send_after_peer_drop_fails() {
	let (mut client, engine) = memory_pair();
	drop(engine);

	let err = client.sender.send(json!({"id": 1})).await.unwrap_err();
	assert!(matches!(err, Error::ChannelClosed));
}

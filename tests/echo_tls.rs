//! End-to-end echo over mutual TLS: round-trips, server-initiated
//! requests, and large payloads.

mod common;

use common::{bind_tls_server, dial, dial_with_options, spawn_server, test_pki};
use riptide::middleware::Echo;
use riptide::ConnOptions;
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::test]
async fn echo_round_trip() {
    let pki = test_pki();
    let mut server = bind_tls_server(&pki).await;
    server.req_middleware(Echo);
    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = dial(&addr, &pki, true).await;
    client.start().unwrap();

    let response = client
        .call("echo", Some(json!({"message": "test message"})))
        .await
        .unwrap();
    let result: Value = response.decode_result().unwrap();
    assert_eq!(result, json!({"message": "test message"}));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_initiated_request() {
    let pki = test_pki();
    let mut server = bind_tls_server(&pki).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.on_connect(move |conn| {
        let tx = tx.clone();
        async move {
            conn.send_request("echo", Some(json!({"message": "Hello!"})), move |result| {
                let _ = tx.send(result);
            })
            .await?;
            Ok(())
        }
    });

    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = dial(&addr, &pki, true).await;
    client.req_middleware(Echo);
    client.start().unwrap();

    let result = rx.recv().await.expect("callback fired").unwrap();
    let echoed: Value = result.decode_result().unwrap();
    assert_eq!(echoed, json!({"message": "Hello!"}));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn large_payload_round_trips_under_raised_limit() {
    let options = ConnOptions {
        max_msg_size: 8 * 1024 * 1024,
        ..ConnOptions::default()
    };

    let pki = test_pki();
    let mut server = bind_tls_server(&pki).await;
    server.set_options(options.clone()).unwrap();
    server.req_middleware(Echo);
    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = dial_with_options(&addr, &pki, true, options).await;
    client.start().unwrap();

    let blob = "x".repeat(5 * 1024 * 1024);
    let response = client
        .call("echo", Some(json!({ "blob": blob })))
        .await
        .unwrap();
    let result: Value = response.decode_result().unwrap();
    assert_eq!(result["blob"].as_str().unwrap().len(), 5 * 1024 * 1024);
    assert_eq!(result["blob"].as_str().unwrap(), blob);

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn notification_produces_no_reply() {
    let pki = test_pki();
    let mut server = bind_tls_server(&pki).await;
    server.req_middleware(Echo);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    struct NotRecorder(tokio::sync::mpsc::UnboundedSender<Value>);

    #[async_trait::async_trait]
    impl riptide::NotMiddleware for NotRecorder {
        async fn handle(&self, ctx: &mut riptide::NotCtx) -> Result<(), riptide::Error> {
            let _ = self.0.send(ctx.params().unwrap_or(Value::Null));
            ctx.next().await
        }
    }
    server.not_middleware(NotRecorder(tx));

    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = dial(&addr, &pki, true).await;
    client.start().unwrap();

    client
        .send_notification("log", Some(json!({"line": 1})))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), json!({"line": 1}));

    // The next frame the client receives must be the echo response, not
    // some leaked reply to the notification.
    let response = client.call("echo", Some(json!("after"))).await.unwrap();
    let result: Value = response.decode_result().unwrap();
    assert_eq!(result, json!("after"));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn request_deadline_fires_timeout() {
    let pki = test_pki();
    let mut server = bind_tls_server(&pki).await;

    // Swallows every request without replying.
    struct Blackhole;

    #[async_trait::async_trait]
    impl riptide::ReqMiddleware for Blackhole {
        async fn handle(&self, ctx: &mut riptide::ReqCtx) -> Result<(), riptide::Error> {
            ctx.done = true;
            Ok(())
        }
    }
    server.req_middleware(Blackhole);

    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = dial(&addr, &pki, true).await;
    client.start().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .send_request_with_deadline(
            "slow",
            Some(json!({})),
            Duration::from_millis(100),
            move |result| {
                let _ = tx.send(result);
            },
        )
        .await
        .unwrap();

    let result = rx.await.unwrap();
    assert!(matches!(result, Err(riptide::Error::Timeout)));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

//! WebSocket transport: echo round-trips over ws:// and wss://.

mod common;

use common::{spawn_server, test_pki};
use riptide::middleware::Echo;
use riptide::{Client, ConnOptions, Server, TlsOptions};
use serde_json::{json, Value};

#[tokio::test]
async fn echo_over_plain_websocket() {
    let mut server = Server::bind("127.0.0.1:0").await.unwrap();
    server.use_websocket();
    server.req_middleware(Echo);
    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = Client::dial_websocket(
        &format!("ws://{addr}"),
        TlsOptions::default(),
        ConnOptions::default(),
    )
    .await
    .unwrap();
    client.start().unwrap();

    let response = client
        .call("echo", Some(json!({"message": "over websocket"})))
        .await
        .unwrap();
    let result: Value = response.decode_result().unwrap();
    assert_eq!(result, json!({"message": "over websocket"}));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn echo_over_tls_websocket() {
    let pki = test_pki();
    let mut server = Server::bind("127.0.0.1:0").await.unwrap();
    server
        .use_tls(
            &pki.server_cert_pem,
            &pki.server_key_pem,
            Some(&pki.ca_pem),
        )
        .unwrap();
    server.use_websocket();
    server.req_middleware(Echo);
    let port = server.local_addr().unwrap().port();
    let (server, server_task) = spawn_server(server);

    let client = Client::dial_websocket(
        &format!("wss://localhost:{port}"),
        TlsOptions {
            ca: Some(pki.ca_pem.clone()),
            client_cert: Some(pki.client_cert_pem.clone()),
            client_key: Some(pki.client_key_pem.clone()),
        },
        ConnOptions::default(),
    )
    .await
    .unwrap();
    client.start().unwrap();

    let response = client
        .call("echo", Some(json!({"message": "over secure websocket"})))
        .await
        .unwrap();
    let result: Value = response.decode_result().unwrap();
    assert_eq!(result, json!({"message": "over secure websocket"}));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_request_over_websocket() {
    let mut server = Server::bind("127.0.0.1:0").await.unwrap();
    server.use_websocket();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.on_connect(move |conn| {
        let tx = tx.clone();
        async move {
            conn.send_request("echo", Some(json!({"n": 42})), move |result| {
                let _ = tx.send(result);
            })
            .await?;
            Ok(())
        }
    });

    let addr = server.local_addr().unwrap().to_string();
    let (server, server_task) = spawn_server(server);

    let client = Client::dial_websocket(
        &format!("ws://{addr}"),
        TlsOptions::default(),
        ConnOptions::default(),
    )
    .await
    .unwrap();
    client.req_middleware(Echo);
    client.start().unwrap();

    let result = rx.recv().await.expect("callback fired").unwrap();
    let echoed: Value = result.decode_result().unwrap();
    assert_eq!(echoed, json!({"n": 42}));

    client.close().await.unwrap();
    server.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

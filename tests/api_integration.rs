//! HTTP and WebSocket API against a live server on a loopback port.

mod common;

use std::time::Duration;

use common::start_test_server;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn create_session(client: &reqwest::Client, url: String, id: &str) -> Value {
    let resp = client
        .post(url)
        .json(&json!({ "id": id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

/// Poll a job over HTTP until it is terminal, concatenating its output.
async fn poll_job(client: &reqwest::Client, url: &str) -> (Value, String) {
    let mut cursor = 0u64;
    let mut output = String::new();
    for _ in 0..250 {
        let snap: Value = client
            .get(format!("{url}?cursor={cursor}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        output.push_str(snap["output"].as_str().unwrap());
        cursor = snap["cursor"].as_u64().unwrap();
        let status = snap["status"].as_str().unwrap();
        if status != "pending" && status != "running" {
            return (snap, output);
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    panic!("job at {url} did not finish");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_roundtrip_over_http() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    let info = create_session(&client, server.url("/sessions"), "web").await;
    assert_eq!(info["id"], "web");
    assert!(info["pid"].is_u64());

    let resp = client
        .post(server.url("/sessions/web/jobs"))
        .json(&json!({ "argv": ["echo", "hello"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let submitted: Value = resp.json().await.unwrap();
    let job_id = submitted["job_id"].as_u64().unwrap();

    let (snap, output) = poll_job(&client, &server.url(&format!("/sessions/web/jobs/{job_id}"))).await;
    assert_eq!(snap["status"], "completed");
    assert_eq!(snap["exit_code"], 0);
    assert_eq!(output, "hello\n");

    let history: Value = client
        .get(server.url("/sessions/web/history?limit=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 1);
    assert_eq!(history["entries"][0]["job_id"], job_id);
    assert_eq!(history["entries"][0]["output"], "hello\n");

    let jobs: Value = client
        .get(server.url("/sessions/web/jobs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(jobs.as_array().unwrap().len(), 1);

    let resp = client.delete(server.url("/sessions/web")).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client.get(server.url("/sessions/web")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_pending_over_http() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    create_session(&client, server.url("/sessions"), "q").await;

    // Fill every slot so the next job queues.
    for _ in 0..4 {
        let resp = client
            .post(server.url("/sessions/q/jobs"))
            .json(&json!({ "command": "sleep 2" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
    }
    let queued: Value = client
        .post(server.url("/sessions/q/jobs"))
        .json(&json!({ "command": "echo queued" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queued["status"], "pending");
    let job_id = queued["job_id"].as_u64().unwrap();

    let outcome: Value = client
        .post(server.url(&format!("/sessions/q/jobs/{job_id}/cancel")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outcome["cancelled"], true);
    assert_eq!(outcome["status"], "cancelled");

    let snap: Value = client
        .get(server.url(&format!("/sessions/q/jobs/{job_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snap["status"], "cancelled");
    assert!(snap["started_at_ms"].is_null());

    server.sessions.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_limit_is_service_unavailable() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    // The test manager allows 8 sessions.
    for i in 0..8 {
        create_session(&client, server.url("/sessions"), &format!("s{i}")).await;
    }
    let resp = client
        .post(server.url("/sessions"))
        .json(&json!({ "id": "one-too-many" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "resource_exhausted");

    let list: Value = client
        .get(server.url("/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 8);

    server.sessions.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_session_id_is_bad_request() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/sessions"))
        .json(&json!({ "id": "has spaces/and slashes" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(server.sessions.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_enforced_over_http() {
    let server = start_test_server(Some("secret".into())).await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(server.url("/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(server.url("/sessions"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .get(server.url("/sessions"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_streams_job_events() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    create_session(&client, server.url("/sessions"), "live").await;

    let (ws, _) = connect_async(server.ws_url("/sessions/live/ws"))
        .await
        .unwrap();
    let (_tx, mut rx) = ws.split();

    let connected = recv_json(&mut rx).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["session_id"], "live");

    let submitted: Value = client
        .post(server.url("/sessions/live/jobs"))
        .json(&json!({ "command": "echo streamed" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = submitted["job_id"].as_u64().unwrap();

    let mut job_output = String::new();
    loop {
        let event = recv_json(&mut rx).await;
        match event["type"].as_str().unwrap() {
            "output" if event["job_id"] == job_id => {
                job_output.push_str(event["data"].as_str().unwrap());
            }
            "output" => {}
            "job_finished" => {
                assert_eq!(event["job_id"], job_id);
                assert_eq!(event["status"], "completed");
                assert_eq!(event["exit_code"], 0);
                break;
            }
            other => panic!("unexpected event type {other}"),
        }
    }
    assert_eq!(job_output, "streamed\n");

    // Closing the session ends the stream.
    server.sessions.close_session("live").await.unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream did not close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_input_reaches_shell() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    create_session(&client, server.url("/sessions"), "typed").await;

    let (ws, _) = connect_async(server.ws_url("/sessions/typed/ws"))
        .await
        .unwrap();
    let (mut tx, mut rx) = ws.split();
    recv_json(&mut rx).await; // connected

    tx.send(Message::Text("echo typed-$((6*7))\n".into()))
        .await
        .unwrap();

    // Typed commands are unattributed terminal traffic.
    let mut terminal = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = recv_json(&mut rx).await;
            if event["type"] == "output" && event["job_id"].is_null() {
                terminal.push_str(event["data"].as_str().unwrap());
                if terminal.contains("typed-42") {
                    return;
                }
            }
        }
    })
    .await;
    assert!(found.is_ok(), "shell output not seen: {terminal:?}");

    server.sessions.close_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_unknown_session_is_rejected() {
    let server = start_test_server(None).await;
    let result = connect_async(server.ws_url("/sessions/missing/ws")).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_ticket_auth() {
    let server = start_test_server(Some("secret".into())).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(server.url("/sessions"))
        .bearer_auth("secret")
        .json(&json!({ "id": "tok" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    assert!(connect_async(server.ws_url("/sessions/tok/ws")).await.is_err());
    // The long-lived token is never accepted in a URL.
    assert!(connect_async(server.ws_url("/sessions/tok/ws?token=secret"))
        .await
        .is_err());

    let issued: Value = client
        .post(server.url("/auth/ws-ticket"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ticket = issued["ticket"].as_str().unwrap().to_string();

    let url = server.ws_url(&format!("/sessions/tok/ws?ticket={ticket}"));
    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    let (_tx, mut rx) = ws.split();
    let connected = recv_json(&mut rx).await;
    assert_eq!(connected["type"], "connected");

    // Tickets are single use.
    assert!(connect_async(url.as_str()).await.is_err());

    server.sessions.close_all().await;
}

/// Receive the next text message and parse it as JSON.
async fn recv_json(
    ws: &mut futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

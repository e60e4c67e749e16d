use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::{
    fs,
    net::TcpListener,
    process::{Child, Command},
    time::Duration,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Server {
    child: Child,
    http_port: u16,
    ws_port: u16,
    dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn start_server() -> Server {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "BIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\nRELAY_NAME=integration\n",
            http_port, ws_port
        ),
    )
    .unwrap();

    let child = Command::cargo_bin("tidepool")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();

    // allow servers to start
    sleep(Duration::from_millis(300)).await;
    Server {
        child,
        http_port,
        ws_port,
        dir,
    }
}

async fn connect(server: &Server) -> Client {
    let ws_url = format!("ws://127.0.0.1:{}/", server.ws_port);
    let (ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    ws
}

async fn next_json(ws: &mut Client) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(t) = msg {
            return serde_json::from_str(&t).unwrap();
        }
    }
}

#[tokio::test]
async fn serve_cli_runs_http_and_ws() {
    let server = start_server().await;

    // HTTP health check
    let url = format!("http://127.0.0.1:{}/healthz", server.http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["events"], 0);

    // relay information document
    let info: serde_json::Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/", server.http_port))
        .header("Accept", "application/nostr+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["name"], "integration");

    // empty store: only EOSE
    let mut ws = connect(&server).await;
    let req = serde_json::json!(["REQ", "s", {}]);
    ws.send(Message::Text(req.to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await, serde_json::json!(["EOSE", "s"]));
}

#[tokio::test]
async fn publish_cli_reaches_live_subscriber() {
    let server = start_server().await;
    let mut sub = connect(&server).await;
    sub.send(Message::Text(
        serde_json::json!(["REQ", "live", {"kinds": [7]}]).to_string(),
    ))
    .await
    .unwrap();
    assert_eq!(
        next_json(&mut sub).await,
        serde_json::json!(["EOSE", "live"])
    );

    let ws_url = format!("ws://127.0.0.1:{}/", server.ws_port);
    let out = Command::cargo_bin("tidepool")
        .unwrap()
        .args([
            "--env",
            server.dir.path().join("env").to_str().unwrap(),
            "publish",
            "--relay",
            &ws_url,
            "--kind",
            "7",
            "+",
        ])
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("\"OK\""));

    let delivered = next_json(&mut sub).await;
    assert_eq!(delivered[0], "EVENT");
    assert_eq!(delivered[1], "live");
    assert_eq!(delivered[2]["kind"], 7);
    assert_eq!(delivered[2]["content"], "+");

    let url = format!("http://127.0.0.1:{}/healthz", server.http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["events"], 1);
}

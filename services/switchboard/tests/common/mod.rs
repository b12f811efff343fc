//! Shared helpers for the integration suites: an in-process server on an
//! ephemeral port backed by a scratch database, plus a thin WebSocket test
//! client.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard::config::{DatabaseConfig, HttpConfig};
use switchboard::hub::Hub;
use switchboard::index::ConnectionIndex;
use switchboard::rate_limit::RateLimiter;
use switchboard::router::MessageRouter;
use switchboard::session_cache::SessionCache;
use switchboard::store::{SessionRecord, Store};
use switchboard::{build_router, AppState};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_db_config(dir: &std::path::Path) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.join("switchboard.db"),
        pool_max: 5,
        max_lifetime: Duration::from_secs(1800),
        idle_timeout: Duration::from_secs(600),
        migrations_path: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations")),
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

pub async fn spawn_server() -> TestServer {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        Store::open(&test_db_config(tmp.path()))
            .await
            .expect("open store"),
    );
    let cache = Arc::new(SessionCache::new(store.clone()));
    cache.load().await.expect("prime cache");
    let index = Arc::new(ConnectionIndex::new());
    let limiter = Arc::new(RateLimiter::new());
    let router = MessageRouter::new(index.clone(), store.clone(), limiter.clone());
    let hub = Hub::spawn(router, index.clone(), store.clone());
    let state = AppState {
        store,
        cache,
        index,
        hub,
    };

    let http_config = HttpConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
    };
    let app = build_router(state.clone(), &http_config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });

    TestServer {
        addr,
        state,
        _tmp: tmp,
    }
}

pub async fn create_session(
    server: &TestServer,
    name: &str,
    students: &[&str],
) -> SessionRecord {
    let students: Vec<String> = students.iter().map(|s| (*s).to_owned()).collect();
    server
        .state
        .cache
        .create(name, "admin", &students)
        .await
        .expect("create session")
}

pub async fn connect(server: &TestServer, user: &str, role: &str, session: &str) -> WsClient {
    try_connect(server, user, role, session)
        .await
        .expect("ws connect")
}

pub async fn try_connect(
    server: &TestServer,
    user: &str,
    role: &str,
    session: &str,
) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
    let url = format!(
        "ws://{}/ws?user_id={user}&role={role}&session_id={session}",
        server.addr
    );
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

/// Next JSON text frame, skipping transport control frames.
pub async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended while waiting for a frame")
            .expect("websocket error");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("frame is JSON");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no JSON frame arrives within `window`.
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => return other,
            }
        }
    })
    .await;
    if let Ok(frame) = result {
        panic!("expected silence, got {frame:?}");
    }
}

pub async fn send_json(ws: &mut WsClient, value: &serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Drain replay frames until the `history_complete` boundary, returning the
/// replayed messages.
pub async fn read_until_history_complete(ws: &mut WsClient) -> Vec<serde_json::Value> {
    let mut replayed = Vec::new();
    loop {
        let frame = recv_json(ws).await;
        if frame["type"] == "system" && frame["content"]["event"] == "history_complete" {
            return replayed;
        }
        replayed.push(frame);
    }
}

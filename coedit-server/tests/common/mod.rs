use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use axum::http::StatusCode;
use coedit_server::auth::{Claims, Role};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::Value;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Secret shared with `ServerState::temporary`.
pub const TEST_SECRET: &str = "test-secret";

/// Mint a bearer token for a test user.
pub fn token(sub: &str, name: &str) -> String {
    token_with_role(sub, name, Role::User)
}

pub fn token_with_role(sub: &str, name: &str, role: Role) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime returned before UNIX_EPOCH")
        .as_secs();
    let claims = Claims {
        sub: sub.to_string(),
        name: name.to_string(),
        role,
        exp: now + 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(TEST_SECRET.as_bytes()))
        .expect("minting test token")
}

/// A test WebSocket client that sends and receives JSON frames.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receive frames until one carries the given `type`, discarding the
    /// rest (presence chatter may interleave with anything).
    pub async fn recv_type(&mut self, ty: &str) -> Result<Value> {
        loop {
            let msg = self.recv().await?;
            if msg.get("type").and_then(Value::as_str) == Some(ty) {
                return Ok(msg);
            }
        }
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Ok(()),
            }
        }
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(resp.text().await?)
    }

    pub async fn expect_text(&self, id: &str, expected: &str) {
        let actual = self.get(&format!("api/text/{id}")).await.unwrap();
        assert_eq!(actual, expected);
    }

    pub async fn stats(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.get("api/stats").await?)?)
    }

    pub async fn connect(&self, id: &str) -> Result<JsonSocket> {
        self.connect_with(id, None).await
    }

    pub async fn connect_with(&self, id: &str, token: Option<&str>) -> Result<JsonSocket> {
        let query = token.map(|t| format!("?token={t}")).unwrap_or_default();
        let url = format!("ws://{}/api/socket/{id}{query}", self.addr);
        let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(JsonSocket(socket))
    }
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}

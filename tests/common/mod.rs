#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use nostr::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use whitelist_relay::config::{RelayInfoSettings, RelaySettings, WebSocketSettings};
use whitelist_relay::rate_limiter::RateLimitSettings;
use whitelist_relay::server::build_router;
use whitelist_relay::storage::QueryLimits;
use whitelist_relay::validator::ValidationLimits;
use whitelist_relay::RelayState;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_settings(db_path: &Path, relay_url: &str) -> RelaySettings {
    RelaySettings {
        local_addr: "127.0.0.1:0".to_string(),
        relay_url: relay_url.to_string(),
        db_path: db_path.to_string_lossy().into_owned(),
        relay_secret_key: None,
        admin_pubkeys: Vec::new(),
        default_cohort: "member".to_string(),
        admin_cohort: "admin".to_string(),
        sections: HashMap::from([
            ("general".to_string(), BTreeSet::new()),
            ("board".to_string(), BTreeSet::from(["staff".to_string()])),
        ]),
        read_requires_auth: false,
        validation: ValidationLimits::default(),
        rate_limit: RateLimitSettings::default(),
        query: QueryLimits::default(),
        websocket: WebSocketSettings::default(),
        info: RelayInfoSettings::default(),
    }
}

/// Relay state backed by a temporary database, not bound to a socket.
pub async fn test_state(
    relay_url: &str,
    admin: &Keys,
    configure: impl FnOnce(&mut RelaySettings),
) -> (TempDir, Arc<RelayState>) {
    let tmp_dir = TempDir::new().unwrap();
    let mut settings = test_settings(&tmp_dir.path().join("relay.db"), relay_url);
    settings.admin_pubkeys = vec![admin.public_key().to_hex()];
    configure(&mut settings);
    let state = RelayState::open(settings, None, CancellationToken::new())
        .await
        .unwrap();
    (tmp_dir, Arc::new(state))
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<RelayState>,
    pub admin: Keys,
    _tmp_dir: TempDir,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut RelaySettings)) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let admin = Keys::generate();
        let (tmp_dir, state) = test_state(&format!("ws://{addr}"), &admin, configure).await;

        let router = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            state,
            admin,
            _tmp_dir: tmp_dir,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn whitelist(&self, keys: &Keys, cohorts: &[&str]) {
        self.state
            .authorizer
            .whitelist()
            .add_member(
                keys.public_key(),
                cohorts.iter().map(|c| c.to_string()).collect(),
                None,
            )
            .await
            .unwrap();
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.state.cancellation_token.cancel();
    }
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub challenge: String,
    relay_url: String,
}

impl TestClient {
    /// Connects and consumes the AUTH challenge the relay sends first.
    pub async fn connect(relay: &TestRelay) -> Self {
        let (ws, _) = connect_async(relay.url()).await.unwrap();
        let mut client = Self {
            ws,
            challenge: String::new(),
            relay_url: relay.url(),
        };
        let auth = client.recv().await;
        assert_eq!(auth[0], "AUTH");
        client.challenge = auth[1].as_str().unwrap().to_string();
        client
    }

    pub async fn send(&mut self, message: Value) {
        self.ws
            .send(Message::Text(message.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for a relay message")
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        loop {
            let message = match tokio::time::timeout(wait, self.ws.next()).await {
                Err(_) => return None,
                Ok(None) => panic!("relay closed the connection"),
                Ok(Some(message)) => message.unwrap(),
            };
            if let Message::Text(text) = message {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            }
        }
    }

    pub async fn authenticate(&mut self, keys: &Keys) {
        let event = signed_event(
            keys,
            Kind::Authentication,
            "",
            vec![
                tag(&["challenge", &self.challenge]),
                tag(&["relay", &self.relay_url]),
            ],
        );
        self.send(json!(["AUTH", event])).await;
        let reply = self.recv().await;
        assert_eq!(reply, json!(["OK", event.id.to_hex(), true, ""]));
    }

    /// Sends an EVENT and returns the first reply.
    pub async fn publish(&mut self, event: &Event) -> Value {
        self.send(json!(["EVENT", event])).await;
        self.recv().await
    }

    pub async fn subscribe(&mut self, subscription_id: &str, filters: Vec<Value>) {
        let mut message = vec![json!("REQ"), json!(subscription_id)];
        message.extend(filters);
        self.send(Value::Array(message)).await;
    }

    /// Collects EVENT payloads until EOSE for `subscription_id`.
    pub async fn collect_until_eose(&mut self, subscription_id: &str) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let message = self.recv().await;
            match message[0].as_str() {
                Some("EVENT") if message[1] == subscription_id => events.push(message[2].clone()),
                Some("EOSE") if message[1] == subscription_id => return events,
                _ => panic!("unexpected message while waiting for EOSE: {message}"),
            }
        }
    }
}

pub fn tag(values: &[&str]) -> Tag {
    Tag::custom(
        TagKind::Custom(values[0].to_string().into()),
        values[1..].iter().map(|value| value.to_string()),
    )
}

pub fn signed_event(keys: &Keys, kind: Kind, content: &str, tags: Vec<Tag>) -> Event {
    EventBuilder::new(kind, content)
        .tags(tags)
        .sign_with_keys(keys)
        .unwrap()
}

pub fn signed_event_at(
    keys: &Keys,
    kind: Kind,
    content: &str,
    tags: Vec<Tag>,
    created_at: u64,
) -> Event {
    EventBuilder::new(kind, content)
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

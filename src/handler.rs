use crate::app_state::RelayState;
use crate::auth::{verify_http_auth, HttpRequest};
use crate::connection::ClientConnection;
use crate::error::Error;
use crate::metrics;
use crate::whitelist::WhitelistEntry;
use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use nostr::{PublicKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const NOSTR_JSON: &str = "application/nostr+json";

const SUPPORTED_NIPS: [u16; 6] = [1, 9, 11, 40, 42, 98];

#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
    pub supported_nips: Vec<u16>,
    pub software: String,
    pub version: String,
    pub limitation: RelayLimitation,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayLimitation {
    pub max_message_length: usize,
    pub max_subscriptions: usize,
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_subid_length: usize,
    pub max_content_length: usize,
    pub max_event_tags: usize,
    pub auth_required: bool,
    pub restricted_writes: bool,
}

impl RelayInfo {
    pub fn from_state(state: &RelayState) -> Self {
        let settings = &state.settings;
        let validation = state.validator.limits();
        Self {
            name: settings.info.name.clone(),
            description: settings.info.description.clone(),
            pubkey: state.relay_keys.public_key().to_hex(),
            contact: settings.info.contact.clone(),
            supported_nips: SUPPORTED_NIPS.to_vec(),
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            limitation: RelayLimitation {
                max_message_length: settings.websocket.max_message_bytes,
                max_subscriptions: settings.query.max_subscriptions,
                max_filters: settings.query.max_filters,
                max_limit: settings.query.max_limit,
                max_subid_length: crate::codec::MAX_SUBSCRIPTION_ID_LEN,
                max_content_length: validation.max_content_bytes,
                max_event_tags: validation.max_tags,
                auth_required: settings.read_requires_auth,
                restricted_writes: true,
            },
        }
    }
}

fn accepts_nostr_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains(NOSTR_JSON))
}

fn nostr_json_response(state: &RelayState) -> Response {
    (
        [
            (header::CONTENT_TYPE, NOSTR_JSON),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(RelayInfo::from_state(state)),
    )
        .into_response()
}

/// Client address as seen through a reverse proxy.
pub fn get_real_ip(headers: &HeaderMap, socket_addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| socket_addr.ip().to_string())
}

/// WebSocket upgrades, NIP-11 documents and a plain banner share `/`.
pub async fn handle_root(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Response {
    match ws {
        Ok(ws) => {
            let source = get_real_ip(&headers, addr);
            let Some(permit) = state.rate_limiter.acquire_connection(&source) else {
                warn!("Refusing connection from {}: too many open connections", source);
                metrics::rate_limit_denials().increment(1);
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate-limited: too many connections from this address",
                )
                    .into_response();
            };
            debug!("WebSocket upgrade requested from {}", source);
            ws.on_upgrade(move |socket| ClientConnection::run(socket, state, source, permit))
        }
        Err(_) if accepts_nostr_json(&headers) => nostr_json_response(&state),
        Err(_) => format!(
            "{}\n\nThis is a private Nostr relay. Connect with a Nostr client at {}",
            state.settings.info.name, state.settings.relay_url
        )
        .into_response(),
    }
}

pub async fn handle_nostr_json(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Response {
    if accepts_nostr_json(&headers) {
        nostr_json_response(&state)
    } else {
        StatusCode::NOT_ACCEPTABLE.into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub connections: usize,
    pub subscriptions: usize,
    pub events: u64,
}

pub async fn handle_health(State(state): State<Arc<RelayState>>) -> Response {
    match state.database.count_events().await {
        Ok(events) => Json(HealthResponse {
            status: "ok".to_string(),
            uptime_secs: state.uptime().as_secs(),
            connections: state.registry.connection_count(),
            subscriptions: state.registry.subscription_count(),
            events,
        })
        .into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
    }
}

pub async fn handle_metrics(State(state): State<Arc<RelayState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckWhitelistQuery {
    pub pubkey: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckWhitelistResponse {
    pub pubkey: String,
    pub whitelisted: bool,
    pub admin: bool,
    pub cohorts: BTreeSet<String>,
    pub expires_at: Option<u64>,
}

/// Public membership lookup. Expired entries report as not whitelisted.
pub async fn handle_check_whitelist(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<CheckWhitelistQuery>,
) -> Result<Json<CheckWhitelistResponse>, ApiError> {
    let pubkey = parse_pubkey(&query.pubkey)?;
    let whitelist = state.authorizer.whitelist();
    let now = Timestamp::now();
    let entry = whitelist.active_entry(&pubkey, now);
    Ok(Json(CheckWhitelistResponse {
        pubkey: pubkey.to_hex(),
        whitelisted: entry.is_some(),
        admin: whitelist.is_admin(&pubkey, now),
        expires_at: entry
            .as_ref()
            .and_then(|entry| entry.expires_at)
            .map(|at| at.as_u64()),
        cohorts: entry.map(|entry| entry.cohorts).unwrap_or_default(),
    }))
}

/// Relay errors rendered for the admin API.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::AuthRequired { .. } => StatusCode::UNAUTHORIZED,
            Error::Blocked { .. } => StatusCode::FORBIDDEN,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Storage { .. } | Error::Internal { .. } => {
                error!("Admin API failure: {:?}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.client_reason() })),
        )
            .into_response()
    }
}

/// Absolute http(s) url the signed request event must name.
fn request_url(relay_url: &str, uri: &Uri) -> String {
    let base = relay_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        base.to_string()
    };
    let path = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{base}{path}")
}

/// Verifies the signed `Authorization` header and requires the admin cohort.
fn authorize_admin(
    state: &RelayState,
    headers: &HeaderMap,
    method: &Method,
    uri: &Uri,
    body: &[u8],
) -> Result<PublicKey, Error> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::auth_required("missing authorization header"))?;
    let url = request_url(&state.settings.relay_url, uri);
    let request = HttpRequest {
        url: &url,
        method: method.as_str(),
        body,
    };
    let signer = verify_http_auth(header, request, &state.validator, Timestamp::now().as_u64())?;
    state.authorizer.require_admin(&signer)?;
    Ok(signer)
}

fn parse_pubkey(hex: &str) -> Result<PublicKey, Error> {
    PublicKey::from_hex(hex).map_err(|_| Error::invalid(format!("bad pubkey {hex}")))
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::invalid(format!("bad request body: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub pubkey: String,
    #[serde(default)]
    pub cohorts: BTreeSet<String>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SetMemberRequest {
    pub cohorts: BTreeSet<String>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

pub async fn handle_list_whitelist(
    State(state): State<Arc<RelayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Vec<WhitelistEntry>>, ApiError> {
    authorize_admin(&state, &headers, &method, &uri, &[])?;
    Ok(Json(state.authorizer.whitelist().list()))
}

pub async fn handle_add_member(
    State(state): State<Arc<RelayState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WhitelistEntry>), ApiError> {
    let admin = authorize_admin(&state, &headers, &method, &uri, &body)?;
    let request: AddMemberRequest = parse_body(&body)?;
    let pubkey = parse_pubkey(&request.pubkey)?;
    let entry = state
        .authorizer
        .whitelist()
        .add_member(pubkey, request.cohorts, request.expires_at.map(Timestamp::from))
        .await?;
    info!(target: "admin", "{} added {} over HTTP", admin, pubkey);
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn handle_set_member(
    State(state): State<Arc<RelayState>>,
    Path(pubkey): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WhitelistEntry>, ApiError> {
    let admin = authorize_admin(&state, &headers, &method, &uri, &body)?;
    let pubkey = parse_pubkey(&pubkey)?;
    let request: SetMemberRequest = parse_body(&body)?;
    if request.cohorts.is_empty() {
        return Err(Error::invalid("an entry needs at least one cohort").into());
    }
    let entry = WhitelistEntry {
        pubkey,
        cohorts: request.cohorts,
        expires_at: request.expires_at.map(Timestamp::from),
    };
    state.authorizer.whitelist().set_entry(entry.clone()).await?;
    info!(target: "admin", "{} replaced the entry for {} over HTTP", admin, pubkey);
    Ok(Json(entry))
}

pub async fn handle_remove_member(
    State(state): State<Arc<RelayState>>,
    Path(pubkey): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let admin = authorize_admin(&state, &headers, &method, &uri, &[])?;
    let pubkey = parse_pubkey(&pubkey)?;
    if state.authorizer.whitelist().delete(&pubkey).await? {
        info!(target: "admin", "{} removed {} over HTTP", admin, pubkey);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

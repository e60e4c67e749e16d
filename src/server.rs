//! HTTP endpoints for health checks and the NIP-11 relay information document.

use anyhow::Result;
use axum::{
    body::HttpBody,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Span};

use crate::{config::Settings, message::MAX_SUB_ID_LEN, relay::Relay};

/// Media type clients send in `Accept` to ask for the relay document.
const NOSTR_JSON: &str = "application/nostr+json";

#[derive(Clone)]
struct HttpState {
    relay: Arc<Relay>,
    info: Arc<RelayInfo>,
    ws_endpoint: String,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
    /// Open WebSocket connections.
    connections: usize,
    /// Events currently stored.
    events: usize,
}

/// NIP-11 relay information document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
    pub limitation: Limitation,
}

/// Limits advertised in the relay information document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limitation {
    pub max_message_length: usize,
    pub max_subid_length: usize,
    pub auth_required: bool,
    pub payment_required: bool,
    pub restricted_writes: bool,
}

impl RelayInfo {
    pub fn from_settings(cfg: &Settings) -> Self {
        Self {
            name: cfg.relay_name.clone(),
            description: cfg.relay_description.clone(),
            pubkey: cfg.relay_pubkey.clone(),
            contact: cfg.relay_contact.clone(),
            supported_nips: vec![1, 11],
            software: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            limitation: Limitation {
                max_message_length: cfg.max_message_bytes,
                max_subid_length: MAX_SUB_ID_LEN,
                auth_required: false,
                payment_required: false,
                restricted_writes: false,
            },
        }
    }
}

/// Start an HTTP server exposing `/healthz` and the relay information document.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<Relay>,
    cfg: &Settings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let state = HttpState {
        relay,
        info: Arc::new(RelayInfo::from_settings(cfg)),
        ws_endpoint: format!("ws://{}/", cfg.bind_ws),
    };
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(access_span)
                .on_response(access_log),
        )
        .with_state(state)
}

/// Span carrying the request line, peer, and user agent for the access log.
fn access_span(req: &Request) -> Span {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    info_span!(
        "http",
        method = %req.method(),
        path = %req.uri().path(),
        %remote,
        user_agent
    )
}

/// One access log line per response.
fn access_log(res: &Response, latency: Duration, _span: &Span) {
    let bytes = res.body().size_hint().exact().unwrap_or(0);
    info!(
        status = res.status().as_u16(),
        bytes,
        latency_ms = latency.as_millis() as u64,
        "request served"
    );
}

/// Escape text for inclusion in HTML.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Health check endpoint.
async fn healthz(State(state): State<HttpState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        connections: state.relay.hub().len(),
        events: state.relay.store().len(),
    })
}

/// Relay document for `Accept: application/nostr+json`, a short HTML page
/// for browsers otherwise.
async fn relay_info(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(NOSTR_JSON));
    if wants_json {
        return (
            [
                (header::CONTENT_TYPE, NOSTR_JSON),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
                (header::ACCESS_CONTROL_ALLOW_METHODS, "GET"),
            ],
            Json(state.info.as_ref().clone()),
        )
            .into_response();
    }
    Html(format!(
        "<!DOCTYPE html><html><head><title>{name}</title></head><body>\
         <h1>{name}</h1><p>{description}</p>\
         <p>WebSocket endpoint: {ws}</p>\
         <p>Send <code>Accept: {NOSTR_JSON}</code> for the relay information document.</p>\
         </body></html>",
        name = escape_html(&state.info.name),
        description = escape_html(&state.info.description),
        ws = escape_html(&state.ws_endpoint),
    ))
    .into_response()
}

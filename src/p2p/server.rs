//! HTTP surface for peers: one-shot POSTs and WebSocket channel upgrades
//! on `/forge`, plus `/metrics` and `/version`.

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{debug, warn};

use super::network::Network;
use super::transport::{frame::HEADER_LEN, Channel};
use crate::version;

pub fn router(net: Arc<Network>) -> Router {
    let max_request = net.config().max_request_size;
    let min_version = net.config().min_version_parts();
    Router::new()
        .route("/forge", post(handle_request).get(handle_upgrade))
        .route("/metrics", get(metrics))
        .with_state(net)
        .merge(version::router(min_version))
        .layer(DefaultBodyLimit::max(max_request))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
}

/// IPv4-mapped IPv6 addresses are reported as plain IPv4
pub(crate) fn remote_host(addr: &SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}

async fn handle_request(
    State(net): State<Arc<Network>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let host = remote_host(&addr);
    let processed = tokio::task::spawn_blocking(move || net.process_request(&host, &body)).await;
    match processed {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(e) => {
            warn!(peer = %addr, error = %e, "[ROUTER] Request processing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_upgrade(
    State(net): State<Arc<Network>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let host = remote_host(&addr);
    if net.book().get(&host).is_some_and(|p| p.is_blacklisted()) {
        debug!(peer = %host, "[CHANNEL] Refusing channel from blacklisted peer");
        return StatusCode::FORBIDDEN.into_response();
    }
    if !net.transport().uses_persistent_channels() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let limits = net.transport().limits();
    ws.max_message_size(limits.max_message_size + HEADER_LEN)
        .on_upgrade(move |socket| async move {
            let channel = Channel::server(socket, host, limits, net.transport().dispatch());
            net.register_inbound(channel);
        })
}

async fn metrics(State(net): State<Arc<Network>>) -> impl IntoResponse {
    let body = net.metrics().render(net.book());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

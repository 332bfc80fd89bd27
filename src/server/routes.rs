use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::server::{
    client::ClientIdentity,
    handler::handle_socket,
    health::{health_handler, metrics_handler},
    runner::CheckRunner,
    ServerState,
};

/// Builds the HTTP surface: landing page, liveness, metrics and the check socket.
pub fn router<R: CheckRunner>(state: Arc<ServerState<R>>) -> Router {
    Router::new()
        .route("/", get(index_handler::<R>))
        .route("/ws", get(ws_handler::<R>))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler::<R>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the landing page file byte for byte.
async fn index_handler<R: CheckRunner>(State(state): State<Arc<ServerState<R>>>) -> Response {
    match tokio::fs::read(&state.config.index_path).await {
        Ok(body) => ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response(),
        Err(e) => {
            error!(path = ?state.config.index_path, "Failed to read landing page: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Landing page unavailable").into_response()
        }
    }
}

/// Upgrades to a check session after connection-level admission.
async fn ws_handler<R: CheckRunner>(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<ServerState<R>>>,
) -> Response {
    let identity = ClientIdentity::from_request(&headers, peer);

    if state.clients.len() >= state.config.max_connections {
        warn!(%identity, "Connection limit reached, refusing session");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many open sessions").into_response();
    }

    if !state.upgrade_throttle.check(&identity) {
        warn!(%identity, "Too many connection attempts");
        return (StatusCode::TOO_MANY_REQUESTS, "Too many connection attempts").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServerConfig, server::runner::ProcessRunner};
    use axum::{body::Body, http::Request};
    use std::{io::Write, time::Duration};
    use tower::ServiceExt;

    fn app(config: ServerConfig) -> Router {
        let runner = ProcessRunner::new("true", Duration::from_secs(1));
        router(Arc::new(ServerState::new(config, runner).unwrap()))
    }

    async fn get_path(app: Router, path: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_path(app(ServerConfig::default()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn landing_page_is_served_verbatim() {
        let mut page = tempfile::NamedTempFile::new().unwrap();
        let content = "<!doctype html>\n<h1>Mail check</h1>\r\n\u{2713}";
        page.write_all(content.as_bytes()).unwrap();

        let config = ServerConfig {
            index_path: page.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let (status, body) = get_path(app(config), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, content.as_bytes());
    }

    #[tokio::test]
    async fn missing_landing_page_is_a_server_error() {
        let config = ServerConfig {
            index_path: "/nonexistent/index.html".into(),
            ..ServerConfig::default()
        };
        let (status, _) = get_path(app(config), "/").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let (status, body) = get_path(app(ServerConfig::default()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("checks_in_flight"));
    }
}

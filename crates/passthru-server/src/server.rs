//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use passthru_core::{ConfigStore, PassthroughConfig, PassthroughSettings};
use passthru_telemetry::MetricsAggregator;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::{EventBus, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::http;
use crate::registry::SessionRegistry;
use crate::relay::{run_observer_session, run_relay_session, RelayContext};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: RelayContext,
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
}

pub struct RelayServer {
    ctx: RelayContext,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl RelayServer {
    /// Build the server from validated settings.
    pub fn new(settings: PassthroughSettings) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let shutdown = Arc::new(ShutdownCoordinator::new(registry.clone()));
        let ctx = RelayContext {
            config: Arc::new(ConfigStore::new(PassthroughConfig::from_settings(&settings))),
            registry,
            bus: Arc::new(EventBus::new(DEFAULT_SUBSCRIBER_CAPACITY)),
            metrics: Arc::new(MetricsAggregator::new(settings.metrics.max_samples)),
            shutdown: shutdown.token(),
            settings: Arc::new(settings),
        };
        Self {
            ctx,
            shutdown,
            start_time: Instant::now(),
        }
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            ctx: self.ctx.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/", get(http::root))
            .route("/data", get(data_ws))
            .route("/event", get(event_ws))
            .route(
                "/config",
                get(http::get_config)
                    .post(http::update_config)
                    .delete(http::reset_config),
            )
            .route("/health", get(http::health))
            .route("/metrics", get(http::metrics))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let server = &self.ctx.settings.server;
        let listener = tokio::net::TcpListener::bind((server.host.as_str(), server.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "passthrough server listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "http server exited with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Start the periodic metrics roll-up.
    pub fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        self.ctx
            .metrics
            .clone()
            .spawn_reporter(self.ctx.settings.metrics.interval(), self.shutdown.token())
    }

    /// Stop accepting, tear down every session and wait for the session
    /// tasks and `handles`.
    pub async fn shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> ShutdownReport {
        self.shutdown.shutdown(handles, timeout).await
    }
}

/// GET /data: relay session upgrade.
async fn data_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max = state.ctx.settings.server.max_message_size;
    ws.max_message_size(max).on_upgrade(move |socket| {
        state.shutdown.track_session(run_relay_session(socket, state.ctx))
    })
}

/// GET /event: observer session upgrade.
async fn event_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max = state.ctx.settings.server.max_message_size;
    ws.max_message_size(max).on_upgrade(move |socket| {
        state.shutdown.track_session(run_observer_session(socket, state.ctx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn make_server() -> RelayServer {
        RelayServer::new(PassthroughSettings::default())
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_config(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/config")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_reports_running() {
        let server = make_server();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = call(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["message"], "WebSocket Passthrough Server is running");
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_clients"], 0);
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["event_subscribers"], 0);
        assert_eq!(body["sessions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn get_config_shows_defaults() {
        let server = make_server();
        let req = Request::builder().uri("/config").body(Body::empty()).unwrap();
        let (status, body) = call(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"]["port"], 4000);
        assert_eq!(body["target"]["ip"], "127.0.0.1");
        assert_eq!(body["target"]["port"], 3001);
        assert_eq!(body["connection"]["maxRetries"], 10);
    }

    #[tokio::test]
    async fn post_config_updates_target_and_notifies() {
        let server = make_server();
        let mut rx = server.context().config.subscribe();
        let sid = passthru_core::SessionId::new();
        let mut events = server.context().bus.subscribe(&sid).unwrap();

        let req = post_config(r#"{"ip":"10.0.0.7","port":"9000"}"#);
        let (status, body) = call(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"]["ip"], "10.0.0.7");
        assert_eq!(body["target"]["port"], 9000);

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().target.port, 9000);
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, passthru_core::EventKind::ConfigUpdated);
    }

    #[tokio::test]
    async fn post_config_rejects_bad_input() {
        let server = make_server();
        let cases = [
            (r#"{"port":9000}"#, "IP address and port are required"),
            (r#"{"ip":"10.0.0.256","port":9000}"#, "Invalid IP address format"),
            (r#"{"ip":"10.0.0.1","port":70000}"#, "Port must be a number between 1 and 65535"),
            (r#"{"ip":"10.0.0.1","port":0}"#, "Port must be a number between 1 and 65535"),
            ("not json", "IP address and port are required"),
        ];
        for (body, expected) in cases {
            let (status, json) = call(server.router(), post_config(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(json["error"], expected, "body: {body}");
        }
        assert_eq!(server.context().config.current().target.ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn delete_config_resets() {
        let server = make_server();
        let _ = call(server.router(), post_config(r#"{"ip":"10.1.1.1","port":1234}"#)).await;
        let req = Request::builder()
            .method("DELETE")
            .uri("/config")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"]["ip"], "127.0.0.1");
        assert_eq!(body["target"]["port"], 3001);
    }

    #[tokio::test]
    async fn metrics_before_first_rollup() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let (status, body) = call(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["latest"].is_null());
        assert_eq!(body["totals"]["messages"], 0);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_cancels_context_token() {
        let server = make_server();
        let token = server.context().shutdown.clone();
        let report = server.shutdown(Vec::new(), Some(Duration::from_millis(50))).await;
        assert!(token.is_cancelled());
        assert!(server.shutdown_coordinator().is_shutting_down());
        assert!(report.drained);
        assert_eq!(report.clients_closed, 0);
    }
}

//! Plain HTTP endpoints: status, live configuration, health and metrics.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use passthru_core::{EventKind, PassthroughConfig, RelayEvent, TargetConfig};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::health::{self, HealthInputs, HealthResponse};
use crate::server::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

fn config_body(state: &AppState, config: &PassthroughConfig) -> Value {
    json!({
        "server": {
            "host": state.ctx.settings.server.host,
            "port": state.ctx.settings.server.port,
        },
        "target": config.target,
        "connection": config.connection,
    })
}

/// GET /
pub async fn root() -> Json<Value> {
    Json(json!({
        "status": "running",
        "message": "WebSocket Passthrough Server is running",
    }))
}

/// GET /config
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let config = state.ctx.config.current();
    Json(config_body(&state, &config))
}

/// POST /config with `{ip, port}`.
pub async fn update_config(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| {
        warn!(error = %e, "rejected config body");
        bad_request("IP address and port are required")
    })?;

    let target = TargetConfig::from_json(body.get("ip"), body.get("port")).map_err(|e| {
        warn!(error = %e, "rejected config update");
        bad_request(e.to_string())
    })?;

    let config = state.ctx.config.update_target(target);
    info!(target_addr = %config.target.addr(), "default target changed over http");
    let _ = state.ctx.bus.publish(
        RelayEvent::new(
            EventKind::ConfigUpdated,
            None,
            format!("Default target set to {}", config.target.addr()),
        )
        .with_data(json!({ "ip": config.target.ip, "port": config.target.port })),
    );
    Ok(Json(config_body(&state, &config)))
}

/// DELETE /config
pub async fn reset_config(State(state): State<AppState>) -> Json<Value> {
    let config = state.ctx.config.reset();
    let _ = state.ctx.bus.publish(
        RelayEvent::new(EventKind::ConfigReset, None, "Configuration reset to defaults")
            .with_data(json!({ "ip": config.target.ip, "port": config.target.port })),
    );
    Json(config_body(&state, &config))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let inputs = HealthInputs {
        stats: state.ctx.registry.stats(),
        sessions: state.ctx.registry.sessions(),
        active_sessions: state.shutdown.active_sessions(),
        event_subscribers: state.ctx.bus.subscriber_count(),
    };
    Json(health::health_check(state.start_time, inputs))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "latest": state.ctx.metrics.latest(),
        "totals": state.ctx.metrics.totals(),
    }))
}

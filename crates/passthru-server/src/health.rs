//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use crate::registry::{RegistryStats, SessionInfo};

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open client WebSockets, relay and observer.
    pub active_clients: usize,
    /// Live target TCP connections.
    pub active_targets: usize,
    pub active_pairs: usize,
    /// Session tasks still running, including ones already unregistered
    /// and unwinding.
    pub active_sessions: usize,
    pub event_subscribers: usize,
    pub sessions: Vec<SessionInfo>,
}

/// Live counters for [`health_check`].
#[derive(Debug, Default)]
pub struct HealthInputs {
    pub stats: RegistryStats,
    pub sessions: Vec<SessionInfo>,
    pub active_sessions: usize,
    pub event_subscribers: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, inputs: HealthInputs) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_clients: inputs.stats.active_clients,
        active_targets: inputs.stats.active_targets,
        active_pairs: inputs.stats.active_pairs,
        active_sessions: inputs.active_sessions,
        event_subscribers: inputs.event_subscribers,
        sessions: inputs.sessions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TargetInfo;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), HealthInputs::default());
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, HealthInputs::default());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn counters_carried_through() {
        let stats = RegistryStats {
            active_clients: 3,
            active_targets: 2,
            active_pairs: 2,
        };
        let inputs = HealthInputs {
            stats,
            sessions: Vec::new(),
            active_sessions: 4,
            event_subscribers: 1,
        };
        let json = serde_json::to_value(health_check(Instant::now(), inputs)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_clients"], 3);
        assert_eq!(json["active_targets"], 2);
        assert_eq!(json["active_pairs"], 2);
        assert_eq!(json["active_sessions"], 4);
        assert_eq!(json["event_subscribers"], 1);
        assert!(json["uptime_secs"].is_number());
    }

    #[test]
    fn sessions_listed_with_targets() {
        use chrono::Utc;
        use passthru_core::{SessionId, TargetId};

        let sid = SessionId::from_raw("sess_a");
        let session = SessionInfo {
            session_id: sid,
            path: "/data".into(),
            connected_at: Utc::now(),
            target: Some(TargetInfo {
                target_id: TargetId::from_raw("tgt_a"),
                host: "10.0.0.2".into(),
                port: 3001,
                connected_at: Utc::now(),
            }),
        };
        let inputs = HealthInputs {
            sessions: vec![session],
            ..HealthInputs::default()
        };
        let json = serde_json::to_value(health_check(Instant::now(), inputs)).unwrap();
        let row = &json["sessions"][0];
        assert_eq!(row["sessionId"], "sess_a");
        assert_eq!(row["path"], "/data");
        assert_eq!(row["target"]["targetId"], "tgt_a");
        assert_eq!(row["target"]["host"], "10.0.0.2");
        assert_eq!(row["target"]["port"], 3001);
    }
}

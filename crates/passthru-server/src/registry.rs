//! Session registry: who is connected, to what, and how to tear it down.
//!
//! All four maps live behind one mutex so a pairing and its reverse index
//! change together. Endpoints are closed after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use passthru_core::{SessionId, TargetId};
use passthru_target::TargetHandle;
use serde::Serialize;
use tracing::{debug, info};

use crate::relay::ClientChannel;

/// Client side of a session, as the registry sees it.
pub trait ClientEndpoint: Send + Sync {
    fn close(&self);
    fn is_open(&self) -> bool;
}

/// Target side of a session, as the registry sees it.
pub trait TargetEndpoint: Send + Sync {
    fn destroy(&self);
}

impl ClientEndpoint for ClientChannel {
    fn close(&self) {
        ClientChannel::close(self);
    }

    fn is_open(&self) -> bool {
        ClientChannel::is_open(self)
    }
}

impl TargetEndpoint for TargetHandle {
    fn destroy(&self) {
        TargetHandle::destroy(self);
    }
}

struct ClientEntry {
    channel: Arc<dyn ClientEndpoint>,
    path: String,
    created_at: DateTime<Utc>,
}

struct TargetEntry {
    session_id: SessionId,
    handle: Arc<dyn TargetEndpoint>,
    host: String,
    port: u16,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    clients: HashMap<SessionId, ClientEntry>,
    targets: HashMap<TargetId, TargetEntry>,
    pairs: HashMap<SessionId, TargetId>,
    reverse: HashMap<TargetId, SessionId>,
}

impl Tables {
    fn unpair_session(&mut self, session_id: &SessionId) -> usize {
        match self.pairs.remove(session_id) {
            Some(target_id) => {
                let _ = self.reverse.remove(&target_id);
                1
            }
            None => 0,
        }
    }

    fn unpair_target(&mut self, target_id: &TargetId) -> usize {
        match self.reverse.remove(target_id) {
            Some(session_id) => {
                if self.pairs.get(&session_id) == Some(target_id) {
                    let _ = self.pairs.remove(&session_id);
                }
                1
            }
            None => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    Session(SessionId),
    Target(TargetId),
}

/// What a [`SessionRegistry::cleanup`] call actually removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub clients_removed: usize,
    pub targets_removed: usize,
    pub pairs_removed: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.clients_removed == 0 && self.targets_removed == 0 && self.pairs_removed == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_clients: usize,
    pub active_targets: usize,
    pub active_pairs: usize,
}

/// A registered target, as shown on `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    pub host: String,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
}

/// One row of [`SessionRegistry::sessions`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// `/data` or `/event`.
    pub path: String,
    pub connected_at: DateTime<Utc>,
    /// The paired target, if any.
    pub target: Option<TargetInfo>,
}

#[derive(Default)]
pub struct SessionRegistry {
    tables: Mutex<Tables>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the client side of a session. Registering the same id again
    /// replaces the earlier entry.
    pub fn register_client(
        &self,
        session_id: &SessionId,
        channel: Arc<dyn ClientEndpoint>,
        path: &str,
    ) {
        let entry = ClientEntry {
            channel,
            path: path.to_string(),
            created_at: Utc::now(),
        };
        let _ = self.tables.lock().clients.insert(session_id.clone(), entry);
        debug!(session_id = %session_id, path, "client registered");
    }

    /// Record a target connection owned by `session_id`. It is not paired
    /// until [`Self::pair`] runs.
    pub fn register_target(
        &self,
        session_id: &SessionId,
        target_id: &TargetId,
        handle: Arc<dyn TargetEndpoint>,
        host: &str,
        port: u16,
    ) {
        let entry = TargetEntry {
            session_id: session_id.clone(),
            handle,
            host: host.to_string(),
            port,
            created_at: Utc::now(),
        };
        let _ = self.tables.lock().targets.insert(target_id.clone(), entry);
        debug!(
            session_id = %session_id,
            target_id = %target_id,
            host,
            port,
            "target registered"
        );
    }

    /// Record `session_id -> target_id`, replacing any earlier pairing of
    /// either side.
    pub fn pair(&self, session_id: &SessionId, target_id: &TargetId) {
        let mut t = self.tables.lock();
        let _ = t.unpair_session(session_id);
        let _ = t.unpair_target(target_id);
        let _ = t.pairs.insert(session_id.clone(), target_id.clone());
        let _ = t.reverse.insert(target_id.clone(), session_id.clone());
        info!(session_id = %session_id, target_id = %target_id, "connection pair created");
    }

    /// Every registered client with its paired target, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let t = self.tables.lock();
        let mut rows: Vec<SessionInfo> = t
            .clients
            .iter()
            .map(|(session_id, client)| {
                let target = t.pairs.get(session_id).and_then(|target_id| {
                    t.targets.get(target_id).map(|e| TargetInfo {
                        target_id: target_id.clone(),
                        host: e.host.clone(),
                        port: e.port,
                        connected_at: e.created_at,
                    })
                });
                SessionInfo {
                    session_id: session_id.clone(),
                    path: client.path.clone(),
                    connected_at: client.created_at,
                    target,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.session_id.as_str().cmp(b.session_id.as_str()))
        });
        rows
    }

    /// Tear down everything reachable from `key`.
    ///
    /// A session key closes the client, destroys every target registered
    /// for the session and drops its pairing. A target key destroys only
    /// that target; the session stays registered. Repeated calls report an
    /// empty [`CleanupReport`].
    pub fn cleanup(&self, key: &RegistryKey) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut client = None;
        let mut targets = Vec::new();

        {
            let mut t = self.tables.lock();
            match key {
                RegistryKey::Session(session_id) => {
                    if let Some(entry) = t.clients.remove(session_id) {
                        report.clients_removed = 1;
                        client = Some(entry);
                    }
                    report.pairs_removed += t.unpair_session(session_id);
                    let owned: Vec<TargetId> = t
                        .targets
                        .iter()
                        .filter(|(_, e)| &e.session_id == session_id)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for target_id in owned {
                        report.pairs_removed += t.unpair_target(&target_id);
                        if let Some(entry) = t.targets.remove(&target_id) {
                            targets.push((target_id, entry));
                        }
                    }
                }
                RegistryKey::Target(target_id) => {
                    report.pairs_removed += t.unpair_target(target_id);
                    if let Some(entry) = t.targets.remove(target_id) {
                        targets.push((target_id.clone(), entry));
                    }
                }
            }
        }
        report.targets_removed = targets.len();

        if let Some(entry) = client {
            if entry.channel.is_open() {
                entry.channel.close();
            }
        }
        for (target_id, entry) in targets {
            entry.handle.destroy();
            debug!(
                target_id = %target_id,
                host = %entry.host,
                port = entry.port,
                "target cleaned up"
            );
        }
        if !report.is_empty() {
            debug!(?key, ?report, "registry cleanup");
        }
        report
    }

    /// Tear down every session and orphaned target.
    pub fn cleanup_all(&self) -> CleanupReport {
        let (sessions, targets): (Vec<SessionId>, Vec<TargetId>) = {
            let t = self.tables.lock();
            (
                t.clients.keys().cloned().collect(),
                t.targets.keys().cloned().collect(),
            )
        };
        let mut total = CleanupReport::default();
        let keys = sessions
            .into_iter()
            .map(RegistryKey::Session)
            .chain(targets.into_iter().map(RegistryKey::Target));
        for key in keys {
            let r = self.cleanup(&key);
            total.clients_removed += r.clients_removed;
            total.targets_removed += r.targets_removed;
            total.pairs_removed += r.pairs_removed;
        }
        info!(
            clients = total.clients_removed,
            targets = total.targets_removed,
            "registry drained"
        );
        total
    }

    /// Live counts. For observability only.
    pub fn stats(&self) -> RegistryStats {
        let t = self.tables.lock();
        RegistryStats {
            active_clients: t.clients.len(),
            active_targets: t.targets.len(),
            active_pairs: t.pairs.len(),
        }
    }
}

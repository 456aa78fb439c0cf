//! Agent Registry: registration, authentication, and the live-WebSocket
//! binding for each agent (§4.2). Durable facts — identity, capacity,
//! status, the `websocket_id` binding — all live in the Store; this struct
//! only adds the in-memory `tx` handle a gateway connection needs to push
//! frames, since that handle can't be serialized (§3 "Ownership").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use sp_common::{AppError, Clock, EventBus};
use sp_common::events::AgentStatusEvent;
use sp_protocol::{Capacity, ControlMessage};
use sp_store::model::{Agent, AgentStatus, Platform};
use sp_store::SqliteStore;

use crate::types::{ConnectOutcome, RegisteredAgent, SendOutcome};

struct LiveConnection {
    tx: mpsc::Sender<ControlMessage>,
    websocket_id: String,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

pub struct AgentRegistry {
    store: Arc<SqliteStore>,
    connections: Arc<RwLock<HashMap<String, LiveConnection>>>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(store: Arc<SqliteStore>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
            clock,
        }
    }

    /// Registers a new agent, or rotates the API key if `agent_id` already
    /// exists (§4.2 "Registration"). The returned key is the only time it
    /// is ever available in plaintext.
    pub fn register_agent(
        &self,
        agent_id: &str,
        platform: Platform,
        region: Option<&str>,
        capacity: Capacity,
    ) -> Result<RegisteredAgent, AppError> {
        let api_key = generate_api_key();
        let api_key_hash = hash_api_key(&api_key).map_err(AppError::Other)?;
        let agent = self
            .store
            .upsert_agent(agent_id, platform, region, &capacity, &api_key_hash, self.clock.now())
            .map_err(|e| AppError::Store(e.to_string()))?;
        info!(agent_id, "agent registered");
        Ok(RegisteredAgent { agent, api_key })
    }

    /// Alias kept distinct from `register_agent` at the call site (§6
    /// boundary lists them as separate operations) even though both route
    /// through the same upsert — re-registration with an existing id IS key
    /// rotation (§4.2).
    pub fn rotate_agent_key(&self, agent_id: &str) -> Result<RegisteredAgent, AppError> {
        let existing = self
            .store
            .get_agent_by_agent_id(agent_id)
            .map_err(|e| AppError::Store(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("agent {agent_id}")))?;
        self.register_agent(agent_id, existing.platform, existing.region.as_deref(), existing.capacity)
    }

    /// Verifies an agent's presented API key by constant-time compare
    /// against the stored hash. Never reveals whether `agent_id` exists —
    /// both "no such agent" and "wrong key" return the same `AppError::Auth`
    /// (§4.2, §7 AuthError).
    pub fn authenticate(&self, agent_id: &str, api_key: &str) -> Result<Agent, AppError> {
        let agent = self
            .store
            .get_agent_by_agent_id(agent_id)
            .map_err(|e| AppError::Store(e.to_string()))?
            .ok_or(AppError::Auth)?;
        let hash = agent.api_key_hash.as_deref().ok_or(AppError::Auth)?;
        if verify_api_key(api_key, hash) {
            Ok(agent)
        } else {
            Err(AppError::Auth)
        }
    }

    /// Completes a successful handshake: assigns a fresh `websocket_id`,
    /// flips `status -> online`, records the in-memory `tx`, and reports
    /// any prior live connection the caller must close with code 4001
    /// (§4.2 step 2, §8 property 5).
    pub async fn on_agent_connected(
        &self,
        agent_id: &str,
        tx: mpsc::Sender<ControlMessage>,
    ) -> Result<ConnectOutcome, AppError> {
        let now = self.clock.now();
        let websocket_id = Uuid::new_v4().to_string();
        let prior_in_store = self
            .store
            .bind_agent_websocket(agent_id, &websocket_id, now)
            .map_err(|e| AppError::Store(e.to_string()))?;

        let prior_tx = {
            let mut conns = self.connections.write().await;
            conns.insert(
                agent_id.to_string(),
                LiveConnection { tx, websocket_id: websocket_id.clone(), connected_at: now },
            )
        };
        if let Some(prior) = &prior_tx {
            warn!(agent_id, prior_ws = %prior.websocket_id, "superseding prior live connection");
        }

        let _ = self.events.agent_status.send(AgentStatusEvent {
            agent_id: agent_id.to_string(),
            status: "online".to_string(),
        });

        Ok(ConnectOutcome {
            websocket_id,
            superseded_websocket_id: prior_in_store.or(prior_tx.map(|c| c.websocket_id)),
        })
    }

    /// Tears down a connection. No-ops quietly if `websocket_id` no longer
    /// matches the live binding — it was already superseded.
    pub async fn on_agent_disconnected(
        &self,
        agent_id: &str,
        websocket_id: &str,
    ) -> Result<(), AppError> {
        {
            let mut conns = self.connections.write().await;
            if let Some(live) = conns.get(agent_id) {
                if live.websocket_id == websocket_id {
                    conns.remove(agent_id);
                }
            }
        }
        self.store
            .clear_agent_websocket(agent_id, websocket_id)
            .map_err(|e| AppError::Store(e.to_string()))?;
        let _ = self.events.agent_status.send(AgentStatusEvent {
            agent_id: agent_id.to_string(),
            status: "offline".to_string(),
        });
        Ok(())
    }

    pub fn record_heartbeat(&self, agent_id: &str) -> Result<(), AppError> {
        self.store
            .record_heartbeat(agent_id, self.clock.now())
            .map_err(|e| AppError::Store(e.to_string()))
    }

    /// Best-effort send over the live connection's writer channel (§4.2
    /// "Ordering and concurrency" — writes are serialized through a single
    /// per-connection task; this just hands the frame to its queue).
    pub async fn send(&self, agent_id: &str, message: ControlMessage) -> SendOutcome {
        let tx = {
            let conns = self.connections.read().await;
            conns.get(agent_id).map(|c| c.tx.clone())
        };
        match tx {
            Some(tx) => match tx.send(message).await {
                Ok(()) => SendOutcome::Delivered,
                Err(_) => SendOutcome::NoLiveConnection,
            },
            None => SendOutcome::NoLiveConnection,
        }
    }

    /// Flips agents whose heartbeat is older than `threshold` to offline and
    /// drops their in-memory connection entry (§4.2 "Heartbeats").
    pub async fn sweep_stale_agents(&self, threshold: DateTime<Utc>) -> Result<Vec<String>, AppError> {
        let offline = self
            .store
            .mark_stale_agents_offline(threshold)
            .map_err(|e| AppError::Store(e.to_string()))?;
        if !offline.is_empty() {
            let mut conns = self.connections.write().await;
            for agent_id in &offline {
                conns.remove(agent_id);
                let _ = self.events.agent_status.send(AgentStatusEvent {
                    agent_id: agent_id.clone(),
                    status: "offline".to_string(),
                });
            }
        }
        Ok(offline)
    }

    /// Agent Selector (§4.3, §4.4): picks the online agent for `platform`
    /// with the lowest `active_sessions / max_sessions` ratio, preferring
    /// `region` when given and available among eligible agents. Not
    /// load-balanced against historical bias (§9 "Assignment policy") — a
    /// reasonable default, not the final word.
    pub fn select_agent(&self, platform: Platform, region: Option<&str>) -> Result<Option<Agent>, AppError> {
        let candidates = self
            .store
            .list_online_agents(platform)
            .map_err(|e| AppError::Store(e.to_string()))?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut scored = Vec::with_capacity(candidates.len());
        for agent in candidates {
            let active = self
                .store
                .count_active_sessions_for_agent(&agent.agent_id)
                .map_err(|e| AppError::Store(e.to_string()))?;
            let max = agent.capacity.max_sessions.max(1);
            let ratio = active as f64 / max as f64;
            let region_match = region.is_some() && agent.region.as_deref() == region;
            scored.push((region_match, ratio, agent));
        }
        // Region-matching agents sort first; within each group, lowest ratio wins.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.total_cmp(&b.1)));
        Ok(scored.into_iter().next().map(|(_, _, agent)| agent))
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, AppError> {
        self.store
            .get_agent_by_agent_id(agent_id)
            .map_err(|e| AppError::Store(e.to_string()))
    }

    /// Agent ids currently bound to a live connection — used to populate
    /// the `registered` frame's "agent-known-session-id set" handshake hint
    /// (§4.2 step 3) by the caller, which cross-references against sessions.
    pub async fn is_live(&self, agent_id: &str) -> bool {
        self.connections.read().await.contains_key(agent_id)
    }

    pub fn status_of(&self, agent_id: &str) -> Result<Option<AgentStatus>, AppError> {
        Ok(self
            .store
            .get_agent_by_agent_id(agent_id)
            .map_err(|e| AppError::Store(e.to_string()))?
            .map(|a| a.status))
    }
}

fn generate_api_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn hash_api_key(key: &str) -> anyhow::Result<String> {
    use argon2::password_hash::SaltString;
    use argon2::{Argon2, PasswordHasher};
    use rand_core::OsRng;

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash failed: {e}"))?;
    Ok(hash.to_string())
}

fn verify_api_key(key: &str, hash: &str) -> bool {
    use argon2::password_hash::PasswordHash;
    use argon2::{Argon2, PasswordVerifier};

    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(key.as_bytes(), &parsed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_common::clock::ManualClock;

    fn registry() -> AgentRegistry {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let clock = ManualClock::new(Utc::now());
        AgentRegistry::new(store, events, clock)
    }

    #[test]
    fn token_round_trip() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        let hash = hash_api_key(&key).unwrap();
        assert!(verify_api_key(&key, &hash));
        assert!(!verify_api_key("wrong", &hash));
    }

    #[test]
    fn register_then_authenticate() {
        let reg = registry();
        let registered = reg
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        let agent = reg.authenticate("k8s-a", &registered.api_key).unwrap();
        assert_eq!(agent.agent_id, "k8s-a");
    }

    #[test]
    fn authenticate_fails_identically_for_unknown_agent_and_wrong_key() {
        let reg = registry();
        let registered = reg
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        let wrong_key = reg.authenticate("k8s-a", "not-the-key").unwrap_err();
        let unknown_agent = reg.authenticate("k8s-z", &registered.api_key).unwrap_err();
        assert!(matches!(wrong_key, AppError::Auth));
        assert!(matches!(unknown_agent, AppError::Auth));
    }

    #[test]
    fn rotate_key_invalidates_previous() {
        let reg = registry();
        let first = reg
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        let second = reg.rotate_agent_key("k8s-a").unwrap();
        assert!(reg.authenticate("k8s-a", &first.api_key).is_err());
        assert!(reg.authenticate("k8s-a", &second.api_key).is_ok());
    }

    #[tokio::test]
    async fn second_connect_reports_superseded_first() {
        let reg = registry();
        reg.register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        let (tx1, _rx1) = mpsc::channel(8);
        let first = reg.on_agent_connected("k8s-a", tx1).await.unwrap();
        assert!(first.superseded_websocket_id.is_none());

        let (tx2, _rx2) = mpsc::channel(8);
        let second = reg.on_agent_connected("k8s-a", tx2).await.unwrap();
        assert_eq!(second.superseded_websocket_id.as_deref(), Some(first.websocket_id.as_str()));
        assert!(reg.is_live("k8s-a").await);
    }

    #[test]
    fn select_agent_prefers_lowest_load_ratio() {
        let reg = registry();
        reg.register_agent("a1", Platform::Kubernetes, None, Capacity { max_sessions: 10, cpu: None, memory: None })
            .unwrap();
        reg.register_agent("a2", Platform::Kubernetes, None, Capacity { max_sessions: 10, cpu: None, memory: None })
            .unwrap();
        reg.store.bind_agent_websocket("a1", "ws-1", reg.clock.now()).unwrap();
        reg.store.bind_agent_websocket("a2", "ws-2", reg.clock.now()).unwrap();

        let picked = reg.select_agent(Platform::Kubernetes, None).unwrap().unwrap();
        // Both at ratio 0 — either is acceptable; the call must not error
        // and must return one of the two registered agents.
        assert!(picked.agent_id == "a1" || picked.agent_id == "a2");
    }

    #[test]
    fn select_agent_returns_none_with_no_online_agents() {
        let reg = registry();
        reg.register_agent("a1", Platform::Kubernetes, None, Capacity { max_sessions: 10, cpu: None, memory: None })
            .unwrap();
        // Never bound a websocket, so status stays offline.
        assert!(reg.select_agent(Platform::Kubernetes, None).unwrap().is_none());
    }
}

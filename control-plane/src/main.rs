mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use sp_common::clock::system as system_clock;
use sp_common::{ControlPlaneConfig, EventBus};
use sp_connections::ConnectionTracker;
use sp_dispatcher::CommandDispatcher;
use sp_reconciler::Reconciler;
use sp_registry::AgentRegistry;
use sp_sessions::SessionStateMachine;
use sp_store::SqliteStore;

use supervisor::{spawn_supervised, ServicePriority};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,control_plane=debug".parse().unwrap()),
        )
        .init();

    info!("control-plane starting...");

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = Arc::new(ControlPlaneConfig::load(config_path.as_deref())?);
    info!(store_path = %config.store_path.display(), gateway_bind = %config.gateway_bind, "config loaded");

    let store = Arc::new(if config.store_path.to_string_lossy() == ":memory:" {
        SqliteStore::open_memory()?
    } else {
        if let Some(parent) = config.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        SqliteStore::open(&config.store_path)?
    });

    let events = Arc::new(EventBus::new());
    let clock = system_clock();

    let registry = Arc::new(AgentRegistry::new(store.clone(), events.clone(), clock.clone()));
    let sessions = Arc::new(SessionStateMachine::new(store.clone(), registry.clone(), clock.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        registry.clone(),
        sessions.clone(),
        events.clone(),
        clock.clone(),
        config.clone(),
    ));
    let connections = Arc::new(ConnectionTracker::new(store.clone(), sessions.clone(), clock.clone()));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        sessions.clone(),
        dispatcher.clone(),
        connections.clone(),
        events.clone(),
        clock.clone(),
        config.clone(),
    ));

    let api_state = sp_api::state::ApiState {
        store: store.clone(),
        registry: registry.clone(),
        sessions: sessions.clone(),
        dispatcher: dispatcher.clone(),
        connections: connections.clone(),
        reconciler: reconciler.clone(),
        events: events.clone(),
        clock: clock.clone(),
        config: config.clone(),
    };
    let router = sp_api::build_router(api_state);
    let gateway_bind = config.gateway_bind.clone();

    spawn_supervised("gateway", ServicePriority::Critical, move || {
        let router = router.clone();
        let bind = gateway_bind.clone();
        async move {
            let addr: SocketAddr = bind.parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("agent gateway + API listening on {addr}");
            axum::serve(listener, router).await?;
            Ok(())
        }
    });

    // Command dispatch workers (§4.4): the claim-and-send pool. Without
    // this, commands created as `pending` are never claimed — the
    // reconciler only ever moves `sent` back to `pending`, it never sends.
    {
        let dispatcher = dispatcher.clone();
        let store = store.clone();
        let workers = config.dispatcher_workers_per_agent.max(1);
        spawn_supervised("dispatch-workers", ServicePriority::Important, move || {
            let dispatcher = dispatcher.clone();
            let store = store.clone();
            async move {
                let mut workers_set = tokio::task::JoinSet::new();
                for _ in 0..workers {
                    let dispatcher = dispatcher.clone();
                    let store = store.clone();
                    workers_set.spawn(async move {
                        loop {
                            match store.list_online_agent_ids() {
                                Ok(agent_ids) => {
                                    for agent_id in agent_ids {
                                        if let Err(e) = dispatcher.dispatch_agent_once(&agent_id).await {
                                            error!(agent_id, "dispatch_agent_once failed: {e}");
                                        }
                                    }
                                }
                                Err(e) => error!("list_online_agent_ids failed: {e}"),
                            }
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    });
                }
                while workers_set.join_next().await.is_some() {}
                Ok(())
            }
        });
    }

    // Heartbeat sweep (§4.3): mark agents offline once they've missed too
    // many beats, tearing down their live connection entries.
    {
        let registry = registry.clone();
        let config = config.clone();
        let clock = clock.clone();
        spawn_supervised("heartbeat-sweep", ServicePriority::Important, move || {
            let registry = registry.clone();
            let config = config.clone();
            let clock = clock.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(config.heartbeat_interval_seconds)).await;
                    let threshold = clock.now() - config.heartbeat_miss_threshold();
                    match registry.sweep_stale_agents(threshold).await {
                        Ok(offline) if !offline.is_empty() => {
                            warn!(count = offline.len(), "agents marked offline by heartbeat sweep");
                        }
                        Ok(_) => {}
                        Err(e) => error!("heartbeat sweep failed: {e}"),
                    }
                }
            }
        });
    }

    // Reconciler loop (§4.6): stale-command recovery, offline-agent resync,
    // orphan-connection cleanup, garbage collection, drift closure.
    {
        let reconciler = reconciler.clone();
        let config = config.clone();
        spawn_supervised("reconciler", ServicePriority::Important, move || {
            let reconciler = reconciler.clone();
            let interval = config.reconciler_interval_seconds;
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                    match reconciler.run_once() {
                        Ok(report) => info!(?report, "reconciler pass complete"),
                        Err(e) => error!("reconciler pass failed: {e}"),
                    }
                }
            }
        });
    }

    // Connection sweep (§4.5): drop stale client connections and hibernate
    // sessions that have been idle with nobody attached.
    {
        let connections = connections.clone();
        let config = config.clone();
        let clock = clock.clone();
        spawn_supervised("connection-sweep", ServicePriority::Important, move || {
            let connections = connections.clone();
            let config = config.clone();
            let clock = clock.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(config.connection_sweep_interval_seconds)).await;
                    let threshold = clock.now() - config.connection_staleness_threshold();
                    if let Err(e) = connections.sweep_stale_connections(threshold) {
                        error!("connection sweep failed: {e}");
                    }
                    match connections.sweep_idle_sessions() {
                        Ok(hibernated) if !hibernated.is_empty() => {
                            info!(count = hibernated.len(), "sessions hibernated for idleness");
                        }
                        Ok(_) => {}
                        Err(e) => error!("idle-session sweep failed: {e}"),
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");
    Ok(())
}

use std::sync::Arc;

use sp_common::{Clock, ControlPlaneConfig, EventBus};
use sp_connections::ConnectionTracker;
use sp_dispatcher::CommandDispatcher;
use sp_reconciler::Reconciler;
use sp_registry::AgentRegistry;
use sp_sessions::SessionStateMachine;
use sp_store::SqliteStore;

/// Shared application state for every route (the Gateway and the narrow §6
/// external-API boundary alike).
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<SqliteStore>,
    pub registry: Arc<AgentRegistry>,
    pub sessions: Arc<SessionStateMachine>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub connections: Arc<ConnectionTracker>,
    pub reconciler: Arc<Reconciler>,
    pub events: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ControlPlaneConfig>,
}

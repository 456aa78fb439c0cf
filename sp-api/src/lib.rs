pub mod error;
pub mod routes;
pub mod state;

use axum::Router;

use state::ApiState;

/// The complete router: the Gateway's agent-facing WS plus the narrow §6
/// boundary the external API layer calls into. There is no SPA or static
/// asset serving here — this core has no UI of its own.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .merge(routes::agents::router())
        .merge(routes::sessions::router())
        .merge(routes::health::router())
        .with_state(state)
}

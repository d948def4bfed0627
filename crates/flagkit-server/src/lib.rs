//! Flagkit Server - REST surface for flags, flaggings and counts
//!
//! The acting user comes from the `X-User-Id` header set by the host in
//! front of this server. Requests without it act as the anonymous user.

pub mod auth;
pub mod http;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use flagkit_core::{
    AccessGate, CascadeHandler, FlagDefinition, FlagRegistry, FlaggingLedger, FlagkitConfig,
    MemoryLedgerStore, PermissionCheck, SharedRegistry,
};

use crate::http::ApiError;

/// Shared application state
pub struct AppState {
    pub ledger: Arc<FlaggingLedger>,
    pub gate: AccessGate,
    pub cascade: CascadeHandler,
}

impl AppState {
    pub fn new(ledger: Arc<FlaggingLedger>, permissions: Arc<dyn PermissionCheck>) -> Self {
        // Drain ledger events into the log; the channel is unbounded.
        // The thread ends once the ledger is dropped.
        if let Ok(events) = ledger.subscribe() {
            std::thread::spawn(move || {
                for event in events {
                    tracing::debug!(?event, "ledger event");
                }
            });
        }
        Self {
            gate: AccessGate::new(ledger.clone(), permissions),
            cascade: CascadeHandler::new(ledger.clone()),
            ledger,
        }
    }

    /// Build the registry, store and permission table from configuration.
    pub fn from_config(config: &FlagkitConfig) -> flagkit_core::Result<Self> {
        let registry = config.build_registry()?;
        tracing::info!(flags = registry.len(), dir = ?registry.definitions_dir(), "loaded flag definitions");
        let store = config.open_store()?;
        let ledger = FlaggingLedger::new(store, registry.into_shared())
            .with_repair_on_desync(config.counters.repair_on_desync);
        let permissions = config.permission_table()?;
        Ok(Self::new(Arc::new(ledger), Arc::new(permissions)))
    }

    /// In-memory ledger over the given registry
    pub fn in_memory(registry: FlagRegistry, permissions: Arc<dyn PermissionCheck>) -> Self {
        let ledger = FlaggingLedger::new(Arc::new(MemoryLedgerStore::new()), registry.into_shared());
        Self::new(Arc::new(ledger), permissions)
    }

    pub fn registry(&self) -> &SharedRegistry {
        self.ledger.registry()
    }

    /// Snapshot of one flag definition
    pub fn definition(&self, flag_id: &str) -> Result<FlagDefinition, ApiError> {
        let registry = self
            .registry()
            .read()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(registry.require(flag_id)?.clone())
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let target = "/flags/{flag_id}/targets/{entity_type}/{entity_id}";
    Router::new()
        // System
        .route("/health", get(http::health))
        // Flag definitions
        .route("/flags", get(http::list_flags))
        .route(
            "/flags/{flag_id}",
            get(http::get_flag).put(http::put_flag).delete(http::delete_flag),
        )
        .route("/flags/{flag_id}/rebuild", post(http::rebuild_counts))
        // Flag actions on a target
        .route(
            &format!("{}/flag", target),
            post(http::flag_target).delete(http::unflag_target),
        )
        .route(&format!("{}/count", target), get(http::get_count))
        .route(&format!("{}/status", target), get(http::get_status))
        .route(&format!("{}/flaggings", target), get(http::list_flaggings))
        // Flaggings
        .route("/flaggings/bulk-delete", post(http::bulk_delete))
        .route(
            "/flaggings/{id}",
            get(http::get_flagging)
                .patch(http::update_flagging)
                .delete(http::delete_flagging),
        )
        // Host lifecycle events
        .route("/events/user-deleted/{user_id}", post(http::user_deleted))
        .route(
            "/events/entity-deleted/{entity_type}/{entity_id}",
            post(http::entity_deleted),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server
pub async fn serve(addr: &str, state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Flagkit server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

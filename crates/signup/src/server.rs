//! HTTP surface and startup wiring.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{Config, GuardKind, StoreKind};
use crate::coordinator::{Coordinator, RegistrationOutcome};
use crate::error::RegistrationError;
use crate::harness::{self, DEFAULT_DUPLICATES};
use crate::identity::{IdentityStore, MemoryIdentityStore, PgIdentityStore, RegistrationRequest};
use crate::lock::{DistributedLock, Guard, LayeredGuard, LocalLockTable, NoGuard, RedisLeaseStore};

/// Most attempts (`count * duplicates`) one batch request may fire.
const MAX_BATCH_ATTEMPTS: usize = 30_000;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

/// Body of every `/register` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub outcome: String,
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl RegisterResponse {
    fn from_result(result: &Result<RegistrationOutcome, RegistrationError>) -> (StatusCode, Self) {
        match result {
            Ok(outcome) => {
                let (status, message, id) = match outcome {
                    RegistrationOutcome::Registered { id } => {
                        (StatusCode::OK, "registration succeeded", Some(*id))
                    }
                    RegistrationOutcome::AlreadyRegistered => (
                        StatusCode::OK,
                        "registration failed, openid already exists",
                        None,
                    ),
                    RegistrationOutcome::Unavailable => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "registration busy for this openid, retry later",
                        None,
                    ),
                };
                (
                    status,
                    Self {
                        outcome: outcome.label().to_string(),
                        code: outcome.code(),
                        message: message.to_string(),
                        id,
                    },
                )
            }
            Err(RegistrationError::StoreUnreachable(reason)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Self::failure("StoreUnreachable", -3, reason),
            ),
            Err(RegistrationError::StoreQuery(reason)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Self::failure("StoreQueryFailed", -5, reason),
            ),
            Err(e @ RegistrationError::LockOwnershipMismatch { .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Self::failure("LockOwnershipMismatch", -4, &e.to_string()),
            ),
        }
    }

    fn failure(outcome: &str, code: i32, message: &str) -> Self {
        Self {
            outcome: outcome.to_string(),
            code,
            message: message.to_string(),
            id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    duplicates: Option<usize>,
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/batch/mock_register_user/{count}", post(batch_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "signup",
        "guard": state.coordinator.guard_name(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The attempt runs on its own task so a client that hangs up mid-request
/// cannot cancel it between acquire and release.
async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> impl IntoResponse {
    let coordinator = Arc::clone(&state.coordinator);
    let joined = tokio::spawn(async move { coordinator.register(&request).await }).await;

    let (status, body) = match joined {
        Ok(result) => RegisterResponse::from_result(&result),
        Err(e) => {
            error!(error = %e, "Registration task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                RegisterResponse::failure("InternalError", -6, "registration task failed"),
            )
        }
    };
    (status, Json(body))
}

fn bad_batch(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "message": message, "code": -1 })),
    )
}

/// Like `/register`, the run is spawned so a disconnecting client cannot
/// drop attempts while they hold guards.
async fn batch_handler(
    State(state): State<AppState>,
    Path(count): Path<usize>,
    Query(query): Query<BatchQuery>,
) -> impl IntoResponse {
    let duplicates = query.duplicates.unwrap_or(DEFAULT_DUPLICATES);
    if count == 0 || duplicates == 0 {
        return bad_batch("count and duplicates must be at least 1".to_string());
    }
    match count.checked_mul(duplicates) {
        Some(attempts) if attempts <= MAX_BATCH_ATTEMPTS => {}
        _ => {
            return bad_batch(format!(
                "count * duplicates must not exceed {MAX_BATCH_ATTEMPTS}"
            ))
        }
    }

    let coordinator = Arc::clone(&state.coordinator);
    let users = harness::mock_users(count);
    let joined =
        tokio::spawn(async move { harness::run_batch(coordinator, users, duplicates).await })
            .await;
    let report = match joined {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Batch task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "batch task failed", "code": -6 })),
            );
        }
    };
    let violations = report.violations();

    (
        StatusCode::OK,
        Json(json!({
            "message": "batch registration finished",
            "code": if violations.is_empty() { 0 } else { -1 },
            "duplicates": duplicates,
            "totals": report.totals(),
            "violations": violations,
        })),
    )
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.stats())
}

/// Connect the configured backends and assemble a coordinator.
pub async fn build_coordinator(config: &Config) -> Result<Coordinator> {
    let store: Arc<dyn IdentityStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryIdentityStore::new()),
        StoreKind::Postgres => {
            let pg = config
                .database
                .as_ref()
                .context("postgres identity store selected without a database config")?;
            let store = PgIdentityStore::connect(pg)
                .await
                .context("failed to connect to identity store")?;
            store
                .ensure_schema()
                .await
                .context("failed to prepare identity store schema")?;
            Arc::new(store)
        }
    };

    let local = config.guard.uses_local_table().then(|| {
        let table = Arc::new(LocalLockTable::new());
        if let Some(period) = config.lock_sweep_interval {
            table.spawn_sweeper(period);
        }
        table
    });

    let remote = if config.guard.needs_coordination_store() {
        let url = config
            .redis_url
            .as_deref()
            .context("distributed guard selected without a coordination store URL")?;
        let leases = RedisLeaseStore::connect(url)
            .await
            .context("failed to connect to coordination store")?;
        Some(
            DistributedLock::new(Arc::new(leases), config.lock_ttl)
                .with_retry_interval(config.acquire_retry),
        )
    } else {
        None
    };

    let guard: Arc<dyn Guard> = match (config.guard, local, remote) {
        (GuardKind::None, _, _) => Arc::new(NoGuard),
        (GuardKind::Local, Some(table), _) => table,
        (GuardKind::Distributed, _, Some(lock)) => Arc::new(lock),
        (GuardKind::Layered, Some(table), Some(lock)) => Arc::new(LayeredGuard::new(table, lock)),
        (kind, _, _) => anyhow::bail!("guard {kind:?} is missing a backend"),
    };

    info!(
        store = store.backend(),
        guard = guard.name(),
        acquire_timeout_ms = config.acquire_timeout.as_millis(),
        lock_ttl_ms = config.lock_ttl.as_millis(),
        "Registration coordinator ready"
    );

    Ok(Coordinator::new(store, guard).with_acquire_timeout(config.acquire_timeout))
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn run_server(config: Config) -> Result<()> {
    let coordinator = Arc::new(build_coordinator(&config).await?);
    let app = build_router(AppState::new(coordinator));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Signup server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Signup server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

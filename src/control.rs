//! Control Surface: HTTP endpoints, the periodic ticker, signal handling,
//! and the single-slot cycle mutex that serializes cleanup cycles.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{http::StatusCode, Json, Router};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditStore, Mode};
use crate::config::Config;
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::policy::{self, RootCycleOutcome};
use crate::probe;
use crate::scanner::ProtectedPaths;

/// Bounded fan-out for concurrent per-root scan/delete workers within a
/// single cycle (`spec.md` §5).
const SCANNER_FANOUT: usize = 4;

/// Per-cycle summary, exposed via `/health` and used to drive metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub mode: &'static str,
    pub files_considered: u64,
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub error_count: u64,
    /// Subset of `error_count` from `audit_io`/`policy` kind errors; drives
    /// the `"unhealthy"` vs `"degraded"` distinction in `/health`.
    pub severe_error_count: u64,
}

pub struct AppState {
    pub config: Arc<Config>,
    pub audit: Arc<StdMutex<AuditStore>>,
    pub metrics: Arc<Metrics>,
    pub protected: Arc<ProtectedPaths>,
    pub cycle_lock: Arc<AsyncMutex<()>>,
    pub last_cycle: watch::Sender<Option<CycleResult>>,
    pub last_cycle_rx: watch::Receiver<Option<CycleResult>>,
    pub started_at: Instant,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        AppState {
            config: self.config.clone(),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
            protected: self.protected.clone(),
            cycle_lock: self.cycle_lock.clone(),
            last_cycle: self.last_cycle.clone(),
            last_cycle_rx: self.last_cycle_rx.clone(),
            started_at: self.started_at,
        }
    }
}

impl AppState {
    pub fn new(config: Config, audit: AuditStore, protected: ProtectedPaths) -> Self {
        let (tx, rx) = watch::channel(None);
        AppState {
            config: Arc::new(config),
            audit: Arc::new(StdMutex::new(audit)),
            metrics: Arc::new(Metrics::new()),
            protected: Arc::new(protected),
            cycle_lock: Arc::new(AsyncMutex::new(())),
            last_cycle: tx,
            last_cycle_rx: rx,
            started_at: Instant::now(),
        }
    }
}

/// Run one full cleanup cycle: probe every root, pick a mode, clean every
/// root concurrently, and record the result.
pub async fn run_cycle(state: AppState, cancel: CancellationToken) -> CycleResult {
    let started = Utc::now();
    let started_instant = Instant::now();

    let mut usages = Vec::new();
    let mut probe_errors = 0u64;
    let mut probed_roots = Vec::with_capacity(state.config.scan_roots.len());
    for root in &state.config.scan_roots {
        match probe::usage(&root.path) {
            Ok(u) => {
                state.metrics.set_used_percent(&root.path.display().to_string(), u.used_percent);
                usages.push((root.clone(), u));
                probed_roots.push(root.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, root = %root.path.display(), "probe failed; skipping root this cycle");
                e.observe(&state.metrics);
                probe_errors += 1;
            }
        }
    }

    let usage_refs: Vec<_> = usages.iter().map(|(root, u)| (root, *u)).collect();
    let mode = policy::select_mode(&usage_refs, &state.config);

    // Bounded fan-out per §5: at most `SCANNER_FANOUT` roots scan/delete
    // concurrently within a cycle; excess roots queue for a permit.
    let fanout = Arc::new(tokio::sync::Semaphore::new(SCANNER_FANOUT));

    let tasks: Vec<_> = probed_roots
        .into_iter()
        .map(|root| {
            let config = state.config.clone();
            let audit = state.audit.clone();
            let metrics = state.metrics.clone();
            let protected = state.protected.clone();
            let cancel = cancel.clone();
            let fanout = fanout.clone();
            tokio::spawn(async move {
                let _permit = fanout.acquire_owned().await.expect("fan-out semaphore never closed");
                tokio::task::spawn_blocking(move || {
                    policy::process_root(&root, mode, &config, &audit, &metrics, &protected, &cancel, started)
                })
                .await
            })
        })
        .collect();

    let results = join_all(tasks).await;

    let mut aggregate = RootCycleOutcome::default();
    aggregate.errors += probe_errors;
    for r in results {
        match r {
            Ok(Ok(outcome)) => {
                aggregate.considered += outcome.considered;
                aggregate.deleted += outcome.deleted;
                aggregate.bytes_freed += outcome.bytes_freed;
                aggregate.errors += outcome.errors;
                aggregate.severe_errors += outcome.severe_errors;
            }
            Ok(Err(e)) => {
                let err = AppError::Policy(format!("root cleanup blocking task panicked: {e}"));
                tracing::error!(error = %err, "root cleanup blocking task panicked");
                err.observe(&state.metrics);
                aggregate.errors += 1;
                aggregate.severe_errors += 1;
            }
            Err(e) => {
                let err = AppError::Policy(format!("root cleanup task panicked: {e}"));
                tracing::error!(error = %err, "root cleanup task panicked");
                err.observe(&state.metrics);
                aggregate.errors += 1;
                aggregate.severe_errors += 1;
            }
        }
    }

    let ended = Utc::now();
    let duration = started_instant.elapsed().as_secs_f64();
    let effective_mode = if state.config.dry_run { Mode::DryRun } else { mode };
    state.metrics.record_cycle(effective_mode, duration);

    let result = CycleResult {
        started,
        ended,
        mode: effective_mode.as_str(),
        files_considered: aggregate.considered,
        files_deleted: aggregate.deleted,
        bytes_freed: aggregate.bytes_freed,
        error_count: aggregate.errors,
        severe_error_count: aggregate.severe_errors,
    };

    let _ = state.last_cycle.send(Some(result.clone()));
    result
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    last_cycle: Option<CycleResult>,
    dry_run: bool,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let last_cycle = state.last_cycle_rx.borrow().clone();
    let status = match &last_cycle {
        Some(c) if c.severe_error_count > 0 => "unhealthy",
        Some(c) if c.error_count > 0 => "degraded",
        _ => "ok",
    };
    Json(HealthResponse {
        status,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        last_cycle,
        dry_run: state.config.dry_run,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Serialize)]
struct TriggerResponse {
    cycle_id: String,
}

async fn trigger(State(state): State<AppState>) -> impl IntoResponse {
    let Ok(permit) = state.cycle_lock.clone().try_lock_owned() else {
        return (StatusCode::CONFLICT, Json(serde_json::json!({"error": "cycle in progress"})))
            .into_response();
    };

    let cycle_id = Utc::now().to_rfc3339();
    let response_id = cycle_id.clone();
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let _ = run_cycle(state, cancel).await;
        drop(permit);
    });

    (StatusCode::ACCEPTED, Json(TriggerResponse { cycle_id: response_id })).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/trigger", post(trigger))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::Config;

    fn base_config(dir: &std::path::Path) -> Config {
        Config {
            interval_minutes: 60,
            dry_run: false,
            max_free_percent: 80,
            target_free_percent: 70,
            stack_threshold: 95,
            stack_age_days: 3,
            max_deletes_per_cycle: 100_000,
            cycle_budget_seconds: 600,
            metrics_addr: "127.0.0.1:9090".into(),
            audit_db_path: dir.join("audit.db"),
            scan_roots: vec![],
            config_path: dir.join("config.yaml"),
        }
    }

    fn test_state(dir: &std::path::Path) -> AppState {
        let cfg = base_config(dir);
        let audit = AuditStore::open(&cfg.audit_db_path, false).unwrap();
        let protected = ProtectedPaths {
            audit_db: cfg.audit_db_path.clone(),
            config_file: cfg.config_path.clone(),
            executable: dir.join("does-not-exist-exe"),
            pid_file: None,
        };
        AppState::new(cfg, audit, protected)
    }

    #[tokio::test]
    async fn health_reports_ok_with_no_cycle_run_yet() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["last_cycle"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("storagesage_"));
    }

    // spec.md scenario: POST /trigger while a cycle is already running is
    // rejected with 409 rather than queued or stacked; the cycle lock is the
    // single source of truth for "is a cycle in progress".
    #[tokio::test]
    async fn trigger_rejects_second_call_while_cycle_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        // Hold the cycle lock ourselves to simulate a cycle already running,
        // without needing a real scan root to slow a cycle down.
        let held = state.cycle_lock.clone().try_lock_owned().unwrap();

        let app = router(state);
        let response = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        drop(held);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/trigger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}

/// Drive the periodic ticker: fires a cycle every `interval_minutes`,
/// skipping a tick (never stacking) if a cycle is already in progress.
pub async fn run_ticker(state: AppState, cancel: CancellationToken) {
    let period = Duration::from_secs(state.config.interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Ok(permit) = state.cycle_lock.clone().try_lock_owned() else {
                    tracing::debug!("tick skipped: cycle already in progress");
                    continue;
                };
                let cycle_result = run_cycle(state.clone(), cancel.child_token()).await;
                tracing::info!(
                    mode = cycle_result.mode,
                    deleted = cycle_result.files_deleted,
                    bytes_freed = cycle_result.bytes_freed,
                    errors = cycle_result.error_count,
                    "cleanup cycle completed"
                );
                drop(permit);
            }
        }
    }
}

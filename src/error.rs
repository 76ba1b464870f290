use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::metrics::Metrics;

/// Error taxonomy from the error-handling design: one variant per
/// `errors_total{kind}` label, so every fallible operation maps to exactly
/// one metric bump and one log line.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("scan I/O error on {path}: {source}")]
    ScanIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("delete I/O error on {path}: {source}")]
    DeleteIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("audit store error: {0}")]
    AuditIo(String),

    #[error("probe error on {path}: {source}")]
    ProbeIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("policy invariant breach: {0}")]
    Policy(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// The metric label this error increments under `errors_total{kind}`.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ScanIo { .. } => "scan_io",
            AppError::DeleteIo { .. } => "delete_io",
            AppError::AuditIo(_) => "audit_io",
            AppError::ProbeIo { .. } => "probe_io",
            AppError::Policy(_) => "policy",
            AppError::Config(_) => "config",
        }
    }

    /// Whether this error kind marks `/health` as `"unhealthy"` (vs.
    /// `"degraded"` for merely transient per-entry errors).
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, AppError::AuditIo(_) | AppError::Policy(_))
    }

    /// Bump `errors_total{kind}` for this error. The single conversion site
    /// from a typed error to the metric label named in `SPEC_FULL.md` §7.
    pub fn observe(&self, metrics: &Metrics) {
        metrics.record_error(self.kind());
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::AuditIo(_) | AppError::Policy(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = self.kind();
        (status, Json(ErrorBody { error: self.to_string(), kind })).into_response()
    }
}

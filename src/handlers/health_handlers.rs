//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks disk I/O under the storage root

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Always 200. Performs no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Writes, reads back and removes a probe file under the storage root.
/// 200 when the round trip succeeds, 503 otherwise. A running shutdown also
/// reports not ready.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let tmp_path = service
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(()) => {
            let read = fs::read(&tmp_path).await;
            let removed = fs::remove_file(&tmp_path).await;
            match (read, removed) {
                (Ok(bytes), Ok(())) if bytes == b"readyz" => CheckStatus::ok(),
                (Ok(bytes), Err(e)) if bytes == b"readyz" => CheckStatus {
                    ok: true,
                    error: Some(format!("could not remove tmp file: {e}")),
                },
                (Ok(_), _) => CheckStatus::failed("file content mismatch"),
                (Err(e), _) => CheckStatus::failed(format!("could not read tmp file: {e}")),
            }
        }
        Err(e) => CheckStatus::failed(format!("could not write tmp file: {e}")),
    };

    let running = if service.context().is_stopped() {
        CheckStatus::failed("shutting down")
    } else {
        CheckStatus::ok()
    };

    let overall_ok = disk_check.ok && running.ok;
    let mut checks = HashMap::new();
    checks.insert("disk", disk_check);
    checks.insert("lifecycle", running);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
        }
    }
}

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use tokio::process::Command;

use crate::routes::{AppState, Json};

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub database: bool,
    pub storage: bool,
    pub qemu: bool,
    #[serde(rename = "qemu-img")]
    pub qemu_img: bool,
    pub observer: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub checks: HealthChecks,
}

async fn binary_executable(bin: &std::path::Path) -> bool {
    Command::new(bin).arg("--version").output().await.map(|o| o.status.success()).unwrap_or(false)
}

pub async fn handler(state: State<AppState>) -> impl IntoResponse {
    let database = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db).await.is_ok();
    let storage = tokio::fs::metadata(state.operator.storage_root()).await.map(|m| m.is_dir()).unwrap_or(false);
    let qemu = binary_executable(state.operator.qemu_bin()).await;
    let qemu_img = binary_executable(state.operator.qemu_img_bin()).await;
    let observer_status = state.observer.status().await;

    let checks = HealthChecks { database, storage, qemu, qemu_img, observer: observer_status.running };
    let healthy = checks.database && checks.storage && checks.qemu && checks.qemu_img && checks.observer;
    let status = if healthy { "ok" } else { "degraded" };
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(HealthResponse { status, service: "vman", checks }))
}

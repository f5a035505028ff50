use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use regex::Regex;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::operator::Operator;

const METADATA_BIND: &str = "169.254.169.254:80";

#[derive(Clone)]
struct MetadataState {
    db: SqlitePool,
}

/// Serves the EC2-style guest metadata surface on the link-local address.
/// Binding to port 80 there usually needs elevated capabilities; a failure
/// is logged with a distinct marker and does not take down the rest of the
/// process, per spec.md §4.4.
pub async fn spawn(db: SqlitePool) {
    let state = MetadataState { db };
    let router = build_router(state);

    let addr: SocketAddr = METADATA_BIND.parse().expect("static address parses");
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "metadata service listening");
            if let Err(e) = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await {
                error!(error = %e, "metadata service exited");
            }
        }
        Err(e) => {
            error!(marker = "metadata_bind_failed", %addr, error = %e, "failed to bind metadata service");
        }
    }
}

fn build_router(state: MetadataState) -> Router {
    Router::new()
        .route("/latest/meta-data/", get(list_meta_data))
        .route("/latest/meta-data/instance-id", get(instance_id))
        .route("/latest/meta-data/local-ipv4", get(local_ipv4))
        .route("/latest/meta-data/public-ipv4", get(local_ipv4))
        .route("/latest/meta-data/hostname", get(hostname))
        .route("/latest/meta-data/network/interfaces/macs/{mac}/local-ipv4", get(mac_local_ipv4))
        .route("/latest/meta-data/network/interfaces/macs/{mac}/mac", get(mac_echo))
        .route("/latest/meta-data/public-keys/", get(public_keys_index))
        .route("/latest/meta-data/public-keys/0/openssh-key", get(public_key))
        .route("/latest/user-data", get(user_data))
        .with_state(state)
}

struct ResolvedVm {
    id: String,
    local_ip: Option<String>,
}

async fn resolve_by_source_ip(db: &SqlitePool, source: std::net::IpAddr) -> Option<ResolvedVm> {
    let source = source.to_string();
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT id, local_ip FROM vms WHERE local_ip = $1").bind(&source).fetch_optional(db).await.ok()?;
    row.map(|(id, local_ip)| ResolvedVm { id, local_ip })
}

fn mac_regex() -> Regex {
    Regex::new(r"(?i)/macs/([0-9a-f]{2}(:[0-9a-f]{2}){5})/").expect("static regex compiles")
}

async fn resolve_by_path_mac(db: &SqlitePool, path: &str) -> Option<ResolvedVm> {
    let captures = mac_regex().captures(path)?;
    let mac = captures.get(1)?.as_str().to_lowercase();
    resolve_by_mac(db, &mac).await
}

async fn resolve_by_mac(db: &SqlitePool, mac: &str) -> Option<ResolvedVm> {
    // The vms table doesn't store the MAC since it's deterministic from the
    // id; recompute it per row rather than adding a column just for lookups.
    let rows: Vec<(String, Option<String>)> = sqlx::query_as("SELECT id, local_ip FROM vms").fetch_all(db).await.ok()?;
    rows.into_iter()
        .find(|(id, _)| Operator::derive_mac(id).eq_ignore_ascii_case(mac))
        .map(|(id, local_ip)| ResolvedVm { id, local_ip })
}

async fn resolve_vm(
    db: &SqlitePool,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    raw_path: &str,
) -> Option<ResolvedVm> {
    if let Some(ConnectInfo(addr)) = connect_info {
        if let Some(vm) = resolve_by_source_ip(db, addr.ip()).await {
            return Some(vm);
        }
    }
    resolve_by_path_mac(db, raw_path).await
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "").into_response()
}

fn text(body: String) -> Response {
    (StatusCode::OK, body).into_response()
}

async fn list_meta_data(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/meta-data/").await {
        Some(_) => text("instance-id\nlocal-ipv4\npublic-ipv4\nhostname\nnetwork/\npublic-keys/".into()),
        None => not_found(),
    }
}

async fn instance_id(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/meta-data/instance-id").await {
        Some(vm) => text(vm.id),
        None => not_found(),
    }
}

async fn local_ipv4(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/meta-data/local-ipv4").await {
        Some(vm) => text(vm.local_ip.unwrap_or_default()),
        None => not_found(),
    }
}

async fn hostname(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/meta-data/hostname").await {
        Some(vm) => {
            let hostname: Option<String> =
                sqlx::query_scalar("SELECT hostname FROM vm_metadata WHERE vm_id = $1").bind(&vm.id).fetch_optional(&state.db).await.ok().flatten();
            text(hostname.unwrap_or(vm.id))
        }
        None => not_found(),
    }
}

async fn mac_local_ipv4(
    State(state): State<MetadataState>,
    Path(mac): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let path = format!("/latest/meta-data/network/interfaces/macs/{mac}/local-ipv4");
    match resolve_vm(&state.db, connect_info, &path).await {
        Some(vm) => text(vm.local_ip.unwrap_or_default()),
        None => not_found(),
    }
}

async fn mac_echo(State(state): State<MetadataState>, Path(mac): Path<String>) -> Response {
    match resolve_by_mac(&state.db, &mac.to_lowercase()).await {
        Some(_) => text(mac),
        None => not_found(),
    }
}

async fn public_keys_index(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/meta-data/public-keys/").await {
        Some(vm) => {
            let keys: Option<String> =
                sqlx::query_scalar("SELECT ssh_keys FROM vm_metadata WHERE vm_id = $1").bind(&vm.id).fetch_optional(&state.db).await.ok().flatten();
            match keys.filter(|k| !k.trim().is_empty()) {
                Some(_) => text("0=default".into()),
                None => text(String::new()),
            }
        }
        None => not_found(),
    }
}

async fn public_key(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/meta-data/public-keys/0/openssh-key").await {
        Some(vm) => {
            let keys: Option<String> =
                sqlx::query_scalar("SELECT ssh_keys FROM vm_metadata WHERE vm_id = $1").bind(&vm.id).fetch_optional(&state.db).await.ok().flatten();
            let first_key = keys.and_then(|k| k.lines().next().map(str::to_string)).unwrap_or_default();
            text(first_key)
        }
        None => not_found(),
    }
}

async fn user_data(State(state): State<MetadataState>, connect_info: Option<ConnectInfo<SocketAddr>>) -> Response {
    match resolve_vm(&state.db, connect_info, "/latest/user-data").await {
        Some(vm) => {
            let user_data: Option<String> =
                sqlx::query_scalar("SELECT user_data FROM vm_metadata WHERE vm_id = $1").bind(&vm.id).fetch_optional(&state.db).await.ok().flatten();
            let encoded = user_data.map(|d| STANDARD.encode(d.as_bytes())).unwrap_or_default();
            text(encoded)
        }
        None => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("INSERT INTO templates (name, cpu_count, ram_gb, created_at, updated_at) VALUES ('small', 2, 4, $1, $1)")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO vms (id, template_name, state, local_ip, created_at, updated_at) VALUES ('v1', 'small', 'running', '192.168.100.10', $1, $1)")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO vm_metadata (vm_id, user_data, created_at, updated_at) VALUES ('v1', '#!/bin/sh\necho hi', $1, $1)")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn resolves_user_data_by_source_ip() {
        let pool = seeded_pool().await;
        let vm = resolve_by_source_ip(&pool, "192.168.100.10".parse().unwrap()).await.unwrap();
        assert_eq!(vm.id, "v1");
    }

    #[test]
    fn mac_regex_extracts_mac() {
        let path = "/latest/meta-data/network/interfaces/macs/52:54:00:aa:bb:cc/local-ipv4";
        let captures = mac_regex().captures(path).unwrap();
        assert_eq!(&captures[1], "52:54:00:aa:bb:cc");
    }
}

use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::operator::Operator;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Issue {
    pub issue_type: String,
    pub resource_id: String,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObserverStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub last_issues: Vec<Issue>,
}

struct ObserverState {
    last_issues: Vec<Issue>,
}

/// Cheap `Clone`-able front for the reconciliation task; the task itself owns
/// `ObserverState` behind an `RwLock` so reads from HTTP handlers are cheap.
#[derive(Clone)]
pub struct ObserverHandle {
    state: Arc<RwLock<ObserverState>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ObserverHandle {
    pub async fn status(&self) -> ObserverStatus {
        let state = self.state.read().await;
        ObserverStatus { running: true, interval_secs: self.interval.as_secs(), last_issues: state.last_issues.clone() }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the background reconciliation loop and returns a handle to it.
/// Grounded on the teacher's `Worker::run` `tokio::select!` pattern, with a
/// `CancellationToken` instead of an mpsc receiver so stop requests interrupt
/// the loop within the spec's 100ms bound regardless of what tick it's on.
pub fn spawn(db: SqlitePool, operator: Arc<Operator>, storage_root: PathBuf, interval: Duration) -> ObserverHandle {
    let state = Arc::new(RwLock::new(ObserverState { last_issues: Vec::new() }));
    let cancel = CancellationToken::new();
    let handle = ObserverHandle { state: state.clone(), interval, cancel: cancel.clone() };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("observer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match run_pass(&db, &storage_root).await {
                        Ok(issues) => {
                            state.write().await.last_issues = issues;
                        }
                        Err(e) => {
                            error!(error = %e, "observer pass failed");
                        }
                    }
                    truncate_consoles(&operator, &storage_root).await;
                }
            }
        }
    });

    handle
}

async fn run_pass(db: &SqlitePool, storage_root: &std::path::Path) -> Result<Vec<Issue>, sqlx::Error> {
    let mut issues = Vec::new();

    let live_pids = enumerate_live_vms(storage_root).await;

    let vms: Vec<(String, String)> =
        sqlx::query_as("SELECT id, state FROM vms").fetch_all(db).await?;
    let mut known_ids = HashSet::new();
    for (id, state) in &vms {
        known_ids.insert(id.clone());
        let declared_running = state == "running";
        let observed_running = live_pids.contains(id);
        if declared_running != observed_running {
            issues.push(Issue {
                issue_type: "vm_state_mismatch".into(),
                resource_id: id.clone(),
                details: format!("declared={state} observed_running={observed_running}"),
            });
        }
    }
    for live_id in &live_pids {
        if !known_ids.contains(live_id) {
            issues.push(Issue {
                issue_type: "orphan_process".into(),
                resource_id: live_id.clone(),
                details: "live qemu process has no inventory row".into(),
            });
        }
    }

    let disks: Vec<(String, String, Option<String>)> =
        sqlx::query_as("SELECT id, state, vm_id FROM disks").fetch_all(db).await?;
    let mut known_disk_ids = HashSet::new();
    for (id, state, vm_id) in &disks {
        known_disk_ids.insert(id.clone());
        let image_path = storage_root.join("disks").join(format!("{id}.qcow2"));
        if !tokio::fs::try_exists(&image_path).await.unwrap_or(false) {
            issues.push(Issue { issue_type: "missing_disk".into(), resource_id: id.clone(), details: format!("{}", image_path.display()) });
        }
        let attached = state == "attached";
        let has_vm = vm_id.is_some();
        if attached != has_vm {
            issues.push(Issue {
                issue_type: "disk_state_inconsistent".into(),
                resource_id: id.clone(),
                details: format!("state={state} vm_id={vm_id:?}"),
            });
        }
    }
    if let Ok(mut entries) = tokio::fs::read_dir(storage_root.join("disks")).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".qcow2") {
                if !known_disk_ids.contains(id) {
                    issues.push(Issue { issue_type: "orphan_disk".into(), resource_id: id.to_string(), details: "no inventory row".into() });
                }
            }
        }
    }

    Ok(issues)
}

/// Console logs can grow unbounded while a VM runs; bound them here rather
/// than on every write, per the Operator's maintenance-point contract.
async fn truncate_consoles(operator: &Operator, storage_root: &std::path::Path) {
    let Ok(mut entries) = tokio::fs::read_dir(storage_root.join("vms")).await else { return };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let vm_id = entry.file_name().to_string_lossy().to_string();
        if let Err(e) = operator.truncate_console_if_needed(&vm_id).await {
            error!(vm_id, error = %e, "failed to truncate console log");
        }
    }
}

async fn enumerate_live_vms(storage_root: &std::path::Path) -> HashSet<String> {
    let mut live = HashSet::new();
    let vms_dir = storage_root.join("vms");
    let Ok(mut entries) = tokio::fs::read_dir(&vms_dir).await else { return live };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let vm_id = entry.file_name().to_string_lossy().to_string();
        let pid_path = entry.path().join("qemu.pid");
        if let Ok(contents) = tokio::fs::read_to_string(&pid_path).await {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
                    live.insert(vm_id);
                }
            }
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_storage_yields_no_issues() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("vms")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("disks")).await.unwrap();
        let issues = run_pass(&pool, dir.path()).await.unwrap();
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn running_state_without_pid_is_mismatch() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("INSERT INTO templates (name, cpu_count, ram_gb, created_at, updated_at) VALUES ('small', 2, 4, datetime('now'), datetime('now'))")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO vms (id, template_name, state, created_at, updated_at) VALUES ('v1', 'small', 'running', datetime('now'), datetime('now'))")
            .execute(&pool)
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("vms")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("disks")).await.unwrap();
        let issues = run_pass(&pool, dir.path()).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, "vm_state_mismatch");
        assert_eq!(issues[0].resource_id, "v1");
    }

    #[tokio::test]
    async fn monotonic_under_noop_workload() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("vms")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("disks")).await.unwrap();
        let first = run_pass(&pool, dir.path()).await.unwrap();
        let second = run_pass(&pool, dir.path()).await.unwrap();
        assert_eq!(first, second);
    }
}

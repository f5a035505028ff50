use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use validator::Validate;

use crate::{
    db::{Disk, DiskRepository, DiskRepositoryError, DiskState, SqliteDiskRepository, SqliteVmRepository, VmRepository, VmRepositoryError, VmState},
    error::ApiError,
    routes::{AppState, Json},
};

const DEFAULT_DEVICE: &str = "/dev/xvdb";

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDiskRequest {
    #[validate(range(min = 1))]
    pub size: i64,
    pub mount_point: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AttachDiskRequest {
    #[validate(length(min = 1))]
    pub vm_id: String,
    pub mount_point: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("disk '{0}' not found")]
    NotFound(String),

    #[error("disk '{0}' is attached")]
    Attached(String),

    #[error("disk '{0}' is not available")]
    NotAvailable(String),

    #[error("disk '{0}' is not attached")]
    NotAttached(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("VM '{0}' is not running")]
    VmNotRunning(String),

    #[error("operator error: {0}")]
    Operator(String),

    #[error("database error: {0}")]
    Db(String),
}

impl From<DiskRepositoryError> for HandlerError {
    fn from(e: DiskRepositoryError) -> Self {
        match e {
            DiskRepositoryError::NotFound(id) => Self::NotFound(id),
            DiskRepositoryError::Attached(id) => Self::Attached(id),
            DiskRepositoryError::Db(e) => Self::Db(e.to_string()),
        }
    }
}

impl From<VmRepositoryError> for HandlerError {
    fn from(e: VmRepositoryError) -> Self {
        match e {
            VmRepositoryError::NotFound(id) => Self::VmNotFound(id),
            VmRepositoryError::AlreadyExists(id) => Self::VmNotFound(id),
            VmRepositoryError::Db(e) => Self::Db(e.to_string()),
        }
    }
}

impl From<crate::operator::OperatorError> for HandlerError {
    fn from(e: crate::operator::OperatorError) -> Self {
        Self::Operator(e.to_string())
    }
}

impl From<HandlerError> for ApiError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Attached(_) | HandlerError::NotAvailable(_) | HandlerError::NotAttached(_) => {
                ApiError::Conflict(e.to_string())
            }
            HandlerError::VmNotRunning(_) | HandlerError::Operator(_) => ApiError::Operator(e.to_string()),
            HandlerError::NotFound(_) | HandlerError::VmNotFound(_) => ApiError::NotFound(e.to_string()),
            HandlerError::Db(_) => ApiError::DependencyUnavailable(e.to_string()),
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

pub mod create {
    use super::*;

    pub async fn handler(
        state: State<AppState>,
        request: Json<CreateDiskRequest>,
    ) -> Result<(StatusCode, Json<Disk>), HandlerError> {
        let repo = SqliteDiskRepository::new(state.db.clone());
        let disk = repo.create(request.size, request.mount_point.as_deref()).await?;
        let path = state.operator.disk_path(&disk.id);
        if let Err(e) = state.operator.create_disk_image(&path, request.size as u32, "qcow2").await {
            let _ = repo.delete(&disk.id).await;
            return Err(e.into());
        }
        Ok((StatusCode::CREATED, Json(disk)))
    }
}

pub mod list {
    use super::*;

    pub async fn handler(state: State<AppState>) -> Result<Json<Vec<Disk>>, HandlerError> {
        let repo = SqliteDiskRepository::new(state.db.clone());
        Ok(Json(repo.list().await?))
    }
}

pub mod get {
    use super::*;

    pub async fn handler(state: State<AppState>, Path(id): Path<String>) -> Result<Json<Disk>, HandlerError> {
        let repo = SqliteDiskRepository::new(state.db.clone());
        Ok(Json(repo.get(&id).await?))
    }
}

pub mod delete {
    use super::*;

    pub async fn handler(state: State<AppState>, Path(id): Path<String>) -> Result<StatusCode, HandlerError> {
        let repo = SqliteDiskRepository::new(state.db.clone());
        repo.delete(&id).await?;
        let path = state.operator.disk_path(&id);
        let _ = state.operator.delete_disk_image(&path).await;
        Ok(StatusCode::NO_CONTENT)
    }
}

pub mod attach {
    use super::*;

    pub async fn handler(
        state: State<AppState>,
        Path(id): Path<String>,
        request: Json<AttachDiskRequest>,
    ) -> Result<Json<Disk>, HandlerError> {
        let _guard = state.vm_locks.lock(&request.vm_id).await;

        let disks = SqliteDiskRepository::new(state.db.clone());
        let vms = SqliteVmRepository::new(state.db.clone());

        let disk = disks.get(&id).await?;
        if disk.state != DiskState::Available {
            return Err(HandlerError::NotAvailable(id));
        }
        let vm = vms.get(&request.vm_id).await?;
        if vm.state != VmState::Running {
            return Err(HandlerError::VmNotRunning(vm.id));
        }

        let device = request.mount_point.clone().or_else(|| disk.mount_point.clone()).unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        let disk_path = state.operator.disk_path(&disk.id);
        state.operator.attach_disk(&vm.id, &disk_path, &device).await?;
        disks.attach(&disk.id, &vm.id, &device).await?;
        Ok(Json(disks.get(&disk.id).await?))
    }
}

pub mod detach {
    use super::*;

    pub async fn handler(state: State<AppState>, Path(id): Path<String>) -> Result<Json<Disk>, HandlerError> {
        let disks = SqliteDiskRepository::new(state.db.clone());
        let vms = SqliteVmRepository::new(state.db.clone());

        let disk = disks.get(&id).await?;
        if disk.state != DiskState::Attached {
            return Err(HandlerError::NotAttached(id));
        }
        let Some(vm_id) = disk.vm_id.clone() else {
            disks.detach(&disk.id).await?;
            return Ok(Json(disks.get(&disk.id).await?));
        };

        let vm = vms.get(&vm_id).await;
        let vm_running = matches!(vm, Ok(ref vm) if vm.state == VmState::Running);
        if vm_running {
            let disk_path = state.operator.disk_path(&disk.id);
            state.operator.detach_disk(&vm_id, &disk_path).await?;
        }
        disks.detach(&disk.id).await?;
        Ok(Json(disks.get(&disk.id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_zero_size() {
        let req = CreateDiskRequest { size: 0, mount_point: None };
        assert!(req.validate().is_err());
    }

    #[test]
    fn attach_request_requires_vm_id() {
        let req = AttachDiskRequest { vm_id: String::new(), mount_point: None };
        assert!(req.validate().is_err());
    }

    #[test]
    fn not_attached_message_is_not_inverted() {
        let err = HandlerError::NotAttached("d1".into());
        assert_eq!(err.to_string(), "disk 'd1' is not attached");
    }
}

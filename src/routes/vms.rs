use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::{
        DiskRepository, SqliteDiskRepository, SqliteTemplateRepository, SqliteVmMetadataRepository,
        SqliteVmRepository, TemplateRepository, TemplateRepositoryError, Vm, VmFilter, VmMetadata,
        VmMetadataRepository, VmMetadataUpdate, VmRepository, VmRepositoryError, VmState,
    },
    error::ApiError,
    routes::{AppState, Json, Query},
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateVmRequest {
    #[validate(length(min = 1))]
    pub template_name: String,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListVmsQuery {
    pub state: Option<VmState>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("VM '{0}' already exists")]
    AlreadyExists(String),

    #[error("VM '{0}' not found")]
    NotFound(String),

    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),

    #[error("VM '{0}' is not running")]
    NotRunning(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("operator error: {0}")]
    Operator(String),

    #[error("database error: {0}")]
    Db(String),
}

impl From<VmRepositoryError> for HandlerError {
    fn from(e: VmRepositoryError) -> Self {
        match e {
            VmRepositoryError::NotFound(id) => Self::NotFound(id),
            VmRepositoryError::AlreadyExists(id) => Self::AlreadyExists(id),
            VmRepositoryError::Db(e) => Self::Db(e.to_string()),
        }
    }
}

impl From<TemplateRepositoryError> for HandlerError {
    fn from(e: TemplateRepositoryError) -> Self {
        match e {
            TemplateRepositoryError::NotFound(n) => Self::TemplateNotFound(n),
            other => Self::Db(other.to_string()),
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
            HandlerError::TemplateNotFound(_) | HandlerError::AlreadyExists(_) => ApiError::Conflict(e.to_string()),
            HandlerError::AlreadyRunning(_) | HandlerError::NotRunning(_) | HandlerError::UnknownAction(_)
            | HandlerError::Operator(_) => ApiError::Operator(e.to_string()),
            HandlerError::NotFound(_) => ApiError::NotFound(e.to_string()),
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
        request: Json<CreateVmRequest>,
    ) -> Result<(StatusCode, Json<Vm>), HandlerError> {
        let templates = SqliteTemplateRepository::new(state.db.clone());
        templates.get(&request.template_name).await?;

        let vms = SqliteVmRepository::new(state.db.clone());
        let id = request.name.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let vm = vms.create(&id, &request.template_name).await?;
        Ok((StatusCode::CREATED, Json(vm)))
    }
}

pub mod list {
    use super::*;

    pub async fn handler(
        state: State<AppState>,
        query: Query<ListVmsQuery>,
    ) -> Result<Json<Vec<Vm>>, HandlerError> {
        let vms = SqliteVmRepository::new(state.db.clone());
        Ok(Json(vms.list(VmFilter { state: query.state }).await?))
    }
}

pub mod get {
    use super::*;

    pub async fn handler(state: State<AppState>, Path(id): Path<String>) -> Result<Json<Vm>, HandlerError> {
        let vms = SqliteVmRepository::new(state.db.clone());
        Ok(Json(vms.get(&id).await?))
    }
}

pub mod delete {
    use super::*;

    pub async fn handler(state: State<AppState>, Path(id): Path<String>) -> Result<StatusCode, HandlerError> {
        let vms = SqliteVmRepository::new(state.db.clone());
        let vm = vms.get(&id).await?;

        let _guard = state.vm_locks.lock(&id).await;
        if vm.state == VmState::Running {
            if let Err(e) = state.operator.stop_vm(&id, true, &state.network).await {
                warn!(vm_id = %id, error = %e, "force-stop during delete failed, continuing");
            }
        }

        let disks = SqliteDiskRepository::new(state.db.clone());
        disks.release_all_for_vm(&id).await.map_err(|e| HandlerError::Db(e.to_string()))?;

        let metadata = SqliteVmMetadataRepository::new(state.db.clone());
        let _ = metadata.delete(&id).await;

        vms.delete(&id).await?;
        state.vm_locks.remove(&id).await;
        Ok(StatusCode::NO_CONTENT)
    }
}

pub mod actions {
    use super::*;

    pub async fn handler(
        state: State<AppState>,
        Path((id, action)): Path<(String, String)>,
    ) -> Result<(StatusCode, Json<Vm>), HandlerError> {
        let _guard = state.vm_locks.lock(&id).await;
        let vms = SqliteVmRepository::new(state.db.clone());
        let vm = vms.get(&id).await?;

        match action.as_str() {
            "start" => {
                if vm.state == VmState::Running {
                    return Err(HandlerError::AlreadyRunning(id));
                }
                start(&state, &vms, &id).await?;
            }
            "stop" => {
                if vm.state != VmState::Running {
                    return Err(HandlerError::NotRunning(id));
                }
                stop(&state, &vms, &id).await?;
            }
            "restart" => {
                if vm.state == VmState::Running {
                    stop(&state, &vms, &id).await?;
                }
                start(&state, &vms, &id).await?;
            }
            other => return Err(HandlerError::UnknownAction(other.to_string())),
        }

        Ok((StatusCode::ACCEPTED, Json(vms.get(&id).await?)))
    }

    async fn start(state: &AppState, vms: &SqliteVmRepository, id: &str) -> Result<(), HandlerError> {
        let vm = vms.get(id).await?;
        let templates = SqliteTemplateRepository::new(state.db.clone());
        let template = templates.get(&vm.template_name).await?;

        match state.operator.start_vm(id, None, template.cpu_count as u32, template.ram_gb as u32, &state.network).await
        {
            Ok(started) => {
                vms.set_local_ip(id, started.local_ip.map(|ip| ip.to_string()).as_deref()).await?;
                vms.set_state(id, VmState::Running).await?;
                Ok(())
            }
            Err(e) => {
                vms.set_state(id, VmState::Error).await?;
                Err(e.into())
            }
        }
    }

    async fn stop(state: &AppState, vms: &SqliteVmRepository, id: &str) -> Result<(), HandlerError> {
        match state.operator.stop_vm(id, false, &state.network).await {
            Ok(()) => {
                vms.set_local_ip(id, None).await?;
                vms.set_state(id, VmState::Stopped).await?;
                Ok(())
            }
            Err(e) => {
                vms.set_state(id, VmState::Error).await?;
                Err(e.into())
            }
        }
    }
}

pub mod metadata {
    use super::*;

    #[derive(Debug, Deserialize, Validate)]
    pub struct MetadataUpdateRequest {
        pub hostname: Option<String>,
        pub user_data: Option<String>,
        pub ssh_keys: Option<String>,
    }

    pub async fn get_handler(state: State<AppState>, Path(id): Path<String>) -> Result<Json<VmMetadata>, HandlerError> {
        let vms = SqliteVmRepository::new(state.db.clone());
        vms.get(&id).await?;
        let repo = SqliteVmMetadataRepository::new(state.db.clone());
        Ok(Json(repo.find(&id).await.map_err(|e| HandlerError::Db(e.to_string()))?.unwrap_or_default()))
    }

    pub async fn put_handler(
        state: State<AppState>,
        Path(id): Path<String>,
        request: Json<MetadataUpdateRequest>,
    ) -> Result<Json<VmMetadata>, HandlerError> {
        let vms = SqliteVmRepository::new(state.db.clone());
        vms.get(&id).await?;
        let repo = SqliteVmMetadataRepository::new(state.db.clone());
        let update = VmMetadataUpdate {
            hostname: request.hostname.clone(),
            user_data: request.user_data.clone(),
            ssh_keys: request.ssh_keys.clone(),
        };
        Ok(Json(repo.upsert(&id, update).await.map_err(|e| HandlerError::Db(e.to_string()))?))
    }

    pub async fn delete_handler(state: State<AppState>, Path(id): Path<String>) -> Result<StatusCode, HandlerError> {
        let vms = SqliteVmRepository::new(state.db.clone());
        vms.get(&id).await?;
        let repo = SqliteVmMetadataRepository::new(state.db.clone());
        repo.clear(&id).await.map_err(|e| HandlerError::Db(e.to_string()))?;
        Ok(StatusCode::NO_CONTENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_requires_template_name() {
        let req = CreateVmRequest { template_name: String::new(), name: None };
        assert!(req.validate().is_err());
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, sqlx::Type)]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Stopped,
    Running,
    Paused,
    Error,
}

#[derive(Debug, Clone, Serialize, FromRow, PartialEq)]
pub struct Vm {
    pub id: String,
    pub template_name: String,
    pub state: VmState,
    pub local_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum VmRepositoryError {
    #[error("VM '{0}' already exists")]
    AlreadyExists(String),

    #[error("VM '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Default, Clone)]
pub struct VmFilter {
    pub state: Option<VmState>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn create(&self, id: &str, template_name: &str) -> Result<Vm, VmRepositoryError>;
    async fn get(&self, id: &str) -> Result<Vm, VmRepositoryError>;
    async fn list(&self, filter: VmFilter) -> Result<Vec<Vm>, VmRepositoryError>;
    async fn set_state(&self, id: &str, state: VmState) -> Result<(), VmRepositoryError>;
    async fn set_local_ip(&self, id: &str, local_ip: Option<&str>) -> Result<(), VmRepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), VmRepositoryError>;
}

pub struct SqliteVmRepository {
    pool: SqlitePool,
}

impl SqliteVmRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VmRepository for SqliteVmRepository {
    async fn create(&self, id: &str, template_name: &str) -> Result<Vm, VmRepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO vms (id, template_name, state, created_at, updated_at) VALUES ($1, $2, 'stopped', $3, $3)",
        )
        .bind(id)
        .bind(template_name)
        .bind(now)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(Vm {
                id: id.to_string(),
                template_name: template_name.to_string(),
                state: VmState::Stopped,
                local_ip: None,
                created_at: now,
                updated_at: now,
            }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(VmRepositoryError::AlreadyExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Vm, VmRepositoryError> {
        sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VmRepositoryError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: VmFilter) -> Result<Vec<Vm>, VmRepositoryError> {
        let rows = match filter.state {
            Some(state) => {
                sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE state = $1 ORDER BY id")
                    .bind(state)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => sqlx::query_as::<_, Vm>("SELECT * FROM vms ORDER BY id").fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn set_state(&self, id: &str, state: VmState) -> Result<(), VmRepositoryError> {
        let result = sqlx::query("UPDATE vms SET state = $1, updated_at = $2 WHERE id = $3")
            .bind(state)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VmRepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_local_ip(&self, id: &str, local_ip: Option<&str>) -> Result<(), VmRepositoryError> {
        let result = sqlx::query("UPDATE vms SET local_ip = $1, updated_at = $2 WHERE id = $3")
            .bind(local_ip)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VmRepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), VmRepositoryError> {
        let result = sqlx::query("DELETE FROM vms WHERE id = $1").bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(VmRepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("INSERT INTO templates (name, cpu_count, ram_gb, created_at, updated_at) VALUES ('small', 2, 4, $1, $1)")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn create_defaults_to_stopped() {
        let repo = SqliteVmRepository::new(pool().await);
        let vm = repo.create("v1", "small").await.unwrap();
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(vm.local_ip, None);
    }

    #[tokio::test]
    async fn set_state_and_filter() {
        let repo = SqliteVmRepository::new(pool().await);
        repo.create("v1", "small").await.unwrap();
        repo.create("v2", "small").await.unwrap();
        repo.set_state("v1", VmState::Running).await.unwrap();

        let running = repo.list(VmFilter { state: Some(VmState::Running) }).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "v1");
    }

    #[tokio::test]
    async fn duplicate_id_fails() {
        let repo = SqliteVmRepository::new(pool().await);
        repo.create("v1", "small").await.unwrap();
        let err = repo.create("v1", "small").await.unwrap_err();
        assert!(matches!(err, VmRepositoryError::AlreadyExists(_)));
    }
}

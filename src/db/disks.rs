use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, EnumString, Display, sqlx::Type)]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Available,
    Attached,
}

#[derive(Debug, Clone, Serialize, FromRow, PartialEq)]
pub struct Disk {
    pub id: String,
    pub size_gb: i64,
    pub mount_point: Option<String>,
    pub state: DiskState,
    pub vm_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiskRepositoryError {
    #[error("disk '{0}' not found")]
    NotFound(String),

    #[error("disk '{0}' is attached")]
    Attached(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiskRepository: Send + Sync {
    async fn create(&self, size_gb: i64, mount_point: Option<&str>) -> Result<Disk, DiskRepositoryError>;
    async fn get(&self, id: &str) -> Result<Disk, DiskRepositoryError>;
    async fn list(&self) -> Result<Vec<Disk>, DiskRepositoryError>;
    async fn list_for_vm(&self, vm_id: &str) -> Result<Vec<Disk>, DiskRepositoryError>;
    async fn attach(&self, id: &str, vm_id: &str, mount_point: &str) -> Result<(), DiskRepositoryError>;
    async fn detach(&self, id: &str) -> Result<(), DiskRepositoryError>;
    async fn release_all_for_vm(&self, vm_id: &str) -> Result<(), DiskRepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), DiskRepositoryError>;
}

pub struct SqliteDiskRepository {
    pool: SqlitePool,
}

impl SqliteDiskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiskRepository for SqliteDiskRepository {
    async fn create(&self, size_gb: i64, mount_point: Option<&str>) -> Result<Disk, DiskRepositoryError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO disks (id, size_gb, mount_point, state, created_at, updated_at) VALUES ($1, $2, $3, 'available', $4, $4)",
        )
        .bind(&id)
        .bind(size_gb)
        .bind(mount_point)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Disk {
            id,
            size_gb,
            mount_point: mount_point.map(str::to_string),
            state: DiskState::Available,
            vm_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: &str) -> Result<Disk, DiskRepositoryError> {
        sqlx::query_as::<_, Disk>("SELECT * FROM disks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DiskRepositoryError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Disk>, DiskRepositoryError> {
        Ok(sqlx::query_as::<_, Disk>("SELECT * FROM disks ORDER BY id").fetch_all(&self.pool).await?)
    }

    async fn list_for_vm(&self, vm_id: &str) -> Result<Vec<Disk>, DiskRepositoryError> {
        Ok(sqlx::query_as::<_, Disk>("SELECT * FROM disks WHERE vm_id = $1").bind(vm_id).fetch_all(&self.pool).await?)
    }

    async fn attach(&self, id: &str, vm_id: &str, mount_point: &str) -> Result<(), DiskRepositoryError> {
        let result = sqlx::query(
            "UPDATE disks SET state = 'attached', vm_id = $1, mount_point = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(vm_id)
        .bind(mount_point)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DiskRepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn detach(&self, id: &str) -> Result<(), DiskRepositoryError> {
        let result = sqlx::query(
            "UPDATE disks SET state = 'available', vm_id = NULL, mount_point = NULL, updated_at = $1 WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DiskRepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn release_all_for_vm(&self, vm_id: &str) -> Result<(), DiskRepositoryError> {
        sqlx::query(
            "UPDATE disks SET state = 'available', vm_id = NULL, mount_point = NULL, updated_at = $1 WHERE vm_id = $2",
        )
        .bind(Utc::now())
        .bind(vm_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DiskRepositoryError> {
        let disk = self.get(id).await?;
        if disk.state == DiskState::Attached {
            return Err(DiskRepositoryError::Attached(id.to_string()));
        }
        let result = sqlx::query("DELETE FROM disks WHERE id = $1").bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DiskRepositoryError::NotFound(id.to_string()));
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
        pool
    }

    #[tokio::test]
    async fn create_is_available() {
        let repo = SqliteDiskRepository::new(pool().await);
        let disk = repo.create(10, None).await.unwrap();
        assert_eq!(disk.state, DiskState::Available);
    }

    #[tokio::test]
    async fn delete_attached_fails() {
        let pool = pool().await;
        let repo = SqliteDiskRepository::new(pool.clone());
        let disk = repo.create(10, None).await.unwrap();
        sqlx::query("UPDATE disks SET state = 'attached', vm_id = 'v1' WHERE id = $1").bind(&disk.id).execute(&pool).await.unwrap();
        let err = repo.delete(&disk.id).await.unwrap_err();
        assert!(matches!(err, DiskRepositoryError::Attached(_)));
    }

    #[tokio::test]
    async fn attach_then_detach_clears_fields() {
        let repo = SqliteDiskRepository::new(pool().await);
        let disk = repo.create(10, None).await.unwrap();
        repo.attach(&disk.id, "v1", "/dev/xvdb").await.unwrap();
        repo.detach(&disk.id).await.unwrap();
        let disk = repo.get(&disk.id).await.unwrap();
        assert_eq!(disk.state, DiskState::Available);
        assert_eq!(disk.vm_id, None);
        assert_eq!(disk.mount_point, None);
    }
}

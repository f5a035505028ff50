use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Default, Serialize, FromRow, PartialEq)]
pub struct VmMetadata {
    pub vm_id: String,
    pub hostname: Option<String>,
    pub user_data: Option<String>,
    pub ssh_keys: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct VmMetadataUpdate {
    pub hostname: Option<String>,
    pub user_data: Option<String>,
    pub ssh_keys: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VmMetadataRepositoryError {
    #[error("metadata for VM '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VmMetadataRepository: Send + Sync {
    async fn get(&self, vm_id: &str) -> Result<VmMetadata, VmMetadataRepositoryError>;
    async fn find(&self, vm_id: &str) -> Result<Option<VmMetadata>, VmMetadataRepositoryError>;
    async fn upsert(&self, vm_id: &str, update: VmMetadataUpdate) -> Result<VmMetadata, VmMetadataRepositoryError>;
    async fn clear(&self, vm_id: &str) -> Result<(), VmMetadataRepositoryError>;
    async fn delete(&self, vm_id: &str) -> Result<(), VmMetadataRepositoryError>;
}

pub struct SqliteVmMetadataRepository {
    pool: SqlitePool,
}

impl SqliteVmMetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VmMetadataRepository for SqliteVmMetadataRepository {
    async fn get(&self, vm_id: &str) -> Result<VmMetadata, VmMetadataRepositoryError> {
        self.find(vm_id).await?.ok_or_else(|| VmMetadataRepositoryError::NotFound(vm_id.to_string()))
    }

    async fn find(&self, vm_id: &str) -> Result<Option<VmMetadata>, VmMetadataRepositoryError> {
        Ok(sqlx::query_as::<_, VmMetadata>("SELECT * FROM vm_metadata WHERE vm_id = $1")
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn upsert(&self, vm_id: &str, update: VmMetadataUpdate) -> Result<VmMetadata, VmMetadataRepositoryError> {
        let existing = self.find(vm_id).await?;
        let now = Utc::now();
        let hostname = update.hostname.or_else(|| existing.as_ref().and_then(|m| m.hostname.clone()));
        let user_data = update.user_data.or_else(|| existing.as_ref().and_then(|m| m.user_data.clone()));
        let ssh_keys = update.ssh_keys.or_else(|| existing.as_ref().and_then(|m| m.ssh_keys.clone()));

        sqlx::query(
            "INSERT INTO vm_metadata (vm_id, hostname, user_data, ssh_keys, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             ON CONFLICT(vm_id) DO UPDATE SET hostname = $2, user_data = $3, ssh_keys = $4, updated_at = $5",
        )
        .bind(vm_id)
        .bind(&hostname)
        .bind(&user_data)
        .bind(&ssh_keys)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(vm_id).await
    }

    async fn clear(&self, vm_id: &str) -> Result<(), VmMetadataRepositoryError> {
        sqlx::query(
            "UPDATE vm_metadata SET hostname = NULL, user_data = NULL, ssh_keys = NULL, updated_at = $1 WHERE vm_id = $2",
        )
        .bind(Utc::now())
        .bind(vm_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, vm_id: &str) -> Result<(), VmMetadataRepositoryError> {
        sqlx::query("DELETE FROM vm_metadata WHERE vm_id = $1").bind(vm_id).execute(&self.pool).await?;
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
        sqlx::query("INSERT INTO vms (id, template_name, created_at, updated_at) VALUES ('v1', 'small', $1, $1)")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn upsert_is_partial() {
        let repo = SqliteVmMetadataRepository::new(pool().await);
        repo.upsert("v1", VmMetadataUpdate { hostname: Some("host-a".into()), ..Default::default() }).await.unwrap();
        let meta = repo
            .upsert("v1", VmMetadataUpdate { user_data: Some("#!/bin/sh".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(meta.hostname.as_deref(), Some("host-a"));
        assert_eq!(meta.user_data.as_deref(), Some("#!/bin/sh"));
    }

    #[tokio::test]
    async fn clear_keeps_row() {
        let repo = SqliteVmMetadataRepository::new(pool().await);
        repo.upsert("v1", VmMetadataUpdate { hostname: Some("host-a".into()), ..Default::default() }).await.unwrap();
        repo.clear("v1").await.unwrap();
        let meta = repo.get("v1").await.unwrap();
        assert_eq!(meta.hostname, None);
    }
}

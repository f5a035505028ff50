use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, FromRow, PartialEq)]
pub struct Template {
    pub name: String,
    pub cpu_count: i64,
    pub ram_gb: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateRepositoryError {
    #[error("template '{0}' already exists")]
    AlreadyExists(String),

    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("template '{0}' is referenced by at least one VM")]
    InUse(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn create(&self, name: &str, cpu_count: i64, ram_gb: i64) -> Result<Template, TemplateRepositoryError>;
    async fn get(&self, name: &str) -> Result<Template, TemplateRepositoryError>;
    async fn list(&self) -> Result<Vec<Template>, TemplateRepositoryError>;
    async fn delete(&self, name: &str) -> Result<(), TemplateRepositoryError>;
}

pub struct SqliteTemplateRepository {
    pool: SqlitePool,
}

impl SqliteTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqliteTemplateRepository {
    async fn create(&self, name: &str, cpu_count: i64, ram_gb: i64) -> Result<Template, TemplateRepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO templates (name, cpu_count, ram_gb, created_at, updated_at) VALUES ($1, $2, $3, $4, $4)",
        )
        .bind(name)
        .bind(cpu_count)
        .bind(ram_gb)
        .bind(now)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(Template { name: name.to_string(), cpu_count, ram_gb, created_at: now, updated_at: now }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(TemplateRepositoryError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str) -> Result<Template, TemplateRepositoryError> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TemplateRepositoryError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<Template>, TemplateRepositoryError> {
        Ok(sqlx::query_as::<_, Template>("SELECT * FROM templates ORDER BY name").fetch_all(&self.pool).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), TemplateRepositoryError> {
        let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vms WHERE template_name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        if in_use > 0 {
            return Err(TemplateRepositoryError::InUse(name.to_string()));
        }
        let result = sqlx::query("DELETE FROM templates WHERE name = $1").bind(name).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(TemplateRepositoryError::NotFound(name.to_string()));
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
    async fn create_and_get() {
        let repo = SqliteTemplateRepository::new(pool().await);
        repo.create("small", 2, 4).await.unwrap();
        let template = repo.get("small").await.unwrap();
        assert_eq!(template.cpu_count, 2);
        assert_eq!(template.ram_gb, 4);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let repo = SqliteTemplateRepository::new(pool().await);
        repo.create("small", 2, 4).await.unwrap();
        let err = repo.create("small", 2, 4).await.unwrap_err();
        assert!(matches!(err, TemplateRepositoryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_in_use_fails() {
        let pool = pool().await;
        let templates = SqliteTemplateRepository::new(pool.clone());
        templates.create("small", 2, 4).await.unwrap();
        sqlx::query("INSERT INTO vms (id, template_name, created_at, updated_at) VALUES ('v1', 'small', $1, $1)")
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        let err = templates.delete("small").await.unwrap_err();
        assert!(matches!(err, TemplateRepositoryError::InUse(_)));
    }
}

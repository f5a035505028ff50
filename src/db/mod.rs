use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::info;

pub mod disks;
pub mod metadata;
pub mod templates;
pub mod vms;

pub use disks::{Disk, DiskRepository, DiskRepositoryError, DiskState, SqliteDiskRepository};
pub use metadata::{SqliteVmMetadataRepository, VmMetadata, VmMetadataRepository, VmMetadataRepositoryError, VmMetadataUpdate};
pub use templates::{SqliteTemplateRepository, Template, TemplateRepository, TemplateRepositoryError};
pub use vms::{SqliteVmRepository, Vm, VmFilter, VmRepository, VmRepositoryError, VmState};

/// Connects to the SQLite database at `url`, creating the file if missing,
/// enabling WAL mode, and running embedded migrations.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true).journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new().max_connections(16).connect_with(options).await?;
    info!("running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

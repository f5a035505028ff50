use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use vman::{config::Config, db, logging, metadata, network::NetworkManager, observer, operator::Operator, routes, vm_lock::VmLocks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let _log_guard = logging::init(&config.log);

    info!(storage_path = %config.storage_path.display(), dry_run = config.operator_dry_run, "starting vman");

    tokio::fs::create_dir_all(config.storage_path.join("vms")).await?;
    tokio::fs::create_dir_all(config.storage_path.join("disks")).await?;

    let db = db::connect(&config.database_url()).await?;

    let network = Arc::new(NetworkManager::new(
        config.network.vlan_id,
        config.network.bridge_name.clone(),
        config.network.subnet.clone(),
        config.network.gateway.clone(),
        config.network.dns.clone(),
        config.operator_dry_run,
    )?);
    network.reload_from_storage(&config.storage_path).await;
    if let Err(e) = network.ensure_bridge().await {
        error!(error = %e, "failed to ensure bridge at startup");
    }

    let operator = Arc::new(
        Operator::new(
            config.qemu.qemu_bin.clone(),
            config.qemu.qemu_img_bin.clone(),
            config.storage_path.clone(),
            config.default_boot_disk.clone(),
            config.operator_dry_run,
        )
        .await?,
    );

    let observer_handle =
        observer::spawn(db.clone(), operator.clone(), config.storage_path.clone(), config.observer_interval());

    tokio::spawn(metadata::spawn(db.clone()));

    let state = routes::AppState {
        db,
        operator,
        network,
        observer: observer_handle.clone(),
        vm_locks: VmLocks::new(),
    };
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.api_bind).await?;
    info!(addr = %config.api_bind, "HTTP API listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    observer_handle.stop();
    info!("vman shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

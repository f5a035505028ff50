use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

/// Runtime configuration for the controller, sourced entirely from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "vman", about = "Single-host QEMU/KVM virtual-machine lifecycle controller")]
pub struct Config {
    /// Root directory for per-VM state and disk images.
    #[arg(long, env = "VMAN_STORAGE_PATH", default_value = "/var/lib/vman")]
    pub storage_path: PathBuf,

    /// When set, the Operator and Network Manager log actions instead of performing them.
    #[arg(long, env = "VMAN_OPERATOR_DRY_RUN", default_value_t = false)]
    pub operator_dry_run: bool,

    #[command(flatten)]
    pub network: NetworkConfig,

    /// Path to a prebuilt qcow2 used as the root disk when a VM has none of its own.
    #[arg(long, env = "VMAN_DEFAULT_BOOT_DISK")]
    pub default_boot_disk: Option<PathBuf>,

    #[command(flatten)]
    pub qemu: QemuConfig,

    #[command(flatten)]
    pub log: LogConfig,

    /// Address the JSON HTTP API binds to.
    #[arg(long, env = "VMAN_API_BIND", default_value = "0.0.0.0:8080")]
    pub api_bind: SocketAddr,

    /// Observer reconciliation period. Capped at 5s regardless of what's requested.
    #[arg(long, env = "VMAN_OBSERVER_INTERVAL_SECS", default_value_t = 5)]
    pub observer_interval_secs: u64,

    /// SQLite connection URL, e.g. `sqlite:///var/lib/vman/vman.db`.
    #[arg(long, env = "VMAN_DATABASE_URL")]
    pub database_url: Option<String>,
}

impl Config {
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!("sqlite://{}/vman.db", self.storage_path.display())
        })
    }

    pub fn observer_interval(&self) -> Duration {
        Duration::from_secs(self.observer_interval_secs.min(5).max(1))
    }
}

#[derive(Debug, Clone, Parser)]
pub struct NetworkConfig {
    #[arg(long, env = "VMAN_VLAN_ID", default_value_t = 0)]
    pub vlan_id: u16,

    #[arg(long, env = "VMAN_BRIDGE_NAME", default_value = "vmanbr0")]
    pub bridge_name: String,

    /// Subnet in CIDR form, e.g. `192.168.100.0/24`.
    #[arg(long, env = "VMAN_SUBNET", default_value = "192.168.100.0/24")]
    pub subnet: String,

    #[arg(long, env = "VMAN_GATEWAY", default_value = "192.168.100.1")]
    pub gateway: String,

    /// Comma-separated list of DNS servers.
    #[arg(long, env = "VMAN_DNS", value_delimiter = ',', default_value = "1.1.1.1")]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct QemuConfig {
    #[arg(long, env = "VMAN_QEMU_BIN", default_value = "/usr/bin/qemu-system-x86_64")]
    pub qemu_bin: PathBuf,

    #[arg(long, env = "VMAN_QEMU_IMG_BIN", default_value = "/usr/bin/qemu-img")]
    pub qemu_img_bin: PathBuf,
}

#[derive(Debug, Clone, Parser)]
pub struct LogConfig {
    #[arg(long, env = "VMAN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "VMAN_LOG_FILE")]
    pub log_file: Option<String>,

    #[arg(long, env = "VMAN_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "VMAN_LOG_MAX_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub log_max_bytes: u64,

    #[arg(long, env = "VMAN_LOG_BACKUP_COUNT", default_value_t = 5)]
    pub log_backup_count: u32,
}

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use md5::{Digest, Md5};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    fs, io::AsyncWriteExt, process::Command, time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::network::NetworkManager;
use crate::qmp::{QmpClient, QmpError};

const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const POWERDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const SIGTERM_TIMEOUT: Duration = Duration::from_secs(10);
const DETACH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DETACH_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const CONSOLE_MAX_BYTES: u64 = 50 * 1024;
const DEFAULT_ROOT_DISK_GB: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("disk image already exists: {0}")]
    DiskAlreadyExists(PathBuf),

    #[error("disk image not found: {0}")]
    DiskNotFound(PathBuf),

    #[error("invalid disk size: {0}")]
    InvalidDiskSize(u32),

    #[error("VM '{0}' is already running")]
    VmAlreadyRunning(String),

    #[error("VM '{0}' is not running")]
    VmNotRunning(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("qemu binary not found at {0}")]
    QemuBinaryMissing(PathBuf),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("subprocess '{0}' failed: {1}")]
    SubprocessFailed(String, String),

    #[error("network error: {0}")]
    Network(#[from] crate::network::NetworkError),

    #[error("QMP error: {0}")]
    Qmp(#[from] QmpError),

    #[error("device '{0}' not found on VM")]
    DeviceNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns QEMU child-process lifecycle, QMP interactions, and disk-image
/// operations for every VM. Per-VM directory layout and state-machine
/// sequencing mirror spec.md §3/§4.1 exactly.
pub struct Operator {
    qemu_bin: PathBuf,
    qemu_img_bin: PathBuf,
    storage_root: PathBuf,
    default_boot_disk: Option<PathBuf>,
    dry_run: bool,
}

impl Operator {
    /// Locates and validates the QEMU binary. Refuses anything that isn't an
    /// x86_64 build, per the architecture-enforcement requirement.
    pub async fn new(
        qemu_bin: PathBuf,
        qemu_img_bin: PathBuf,
        storage_root: PathBuf,
        default_boot_disk: Option<PathBuf>,
        dry_run: bool,
    ) -> Result<Self, OperatorError> {
        if !dry_run {
            if !qemu_bin.exists() {
                return Err(OperatorError::QemuBinaryMissing(qemu_bin));
            }
            let name = qemu_bin.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.contains("x86_64") {
                return Err(OperatorError::UnsupportedArchitecture(name.to_string()));
            }
            match Self::probe_machine_types(&qemu_bin).await {
                Ok(types) if types.contains("q35") || types.contains("pc") => {}
                Ok(_) => warn!("qemu binary advertises neither q35 nor pc machine types"),
                Err(e) => warn!(error = %e, "failed to probe qemu machine types"),
            }
        }
        Ok(Self { qemu_bin, qemu_img_bin, storage_root, default_boot_disk, dry_run })
    }

    async fn probe_machine_types(qemu_bin: &Path) -> Result<String, OperatorError> {
        let output = Command::new(qemu_bin).arg("-machine").arg("help").output().await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.storage_root.join("vms").join(vm_id)
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn qemu_bin(&self) -> &Path {
        &self.qemu_bin
    }

    pub fn qemu_img_bin(&self) -> &Path {
        &self.qemu_img_bin
    }

    pub fn disk_path(&self, disk_id: &str) -> PathBuf {
        self.storage_root.join("disks").join(format!("{disk_id}.qcow2"))
    }

    fn pid_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("qemu.pid")
    }

    fn qmp_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("qmp.sock")
    }

    fn console_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("console.txt")
    }

    // --- disk images ---------------------------------------------------

    pub async fn create_disk_image(&self, path: &Path, size_gb: u32, fmt: &str) -> Result<(), OperatorError> {
        if size_gb == 0 {
            return Err(OperatorError::InvalidDiskSize(size_gb));
        }
        if fs::try_exists(path).await.unwrap_or(false) {
            return Err(OperatorError::DiskAlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if self.dry_run {
            info!(path = %path.display(), size_gb, "dry-run: would create disk image");
            return Ok(());
        }
        self.qemu_img(&["create", "-f", fmt, &path.to_string_lossy(), &format!("{size_gb}G")]).await
    }

    pub async fn delete_disk_image(&self, path: &Path) -> Result<(), OperatorError> {
        if self.dry_run {
            info!(path = %path.display(), "dry-run: would delete disk image");
            return Ok(());
        }
        fs::remove_file(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OperatorError::DiskNotFound(path.to_path_buf())
            } else {
                OperatorError::Io(e)
            }
        })
    }

    async fn qemu_img(&self, args: &[&str]) -> Result<(), OperatorError> {
        let output = Command::new(&self.qemu_img_bin).args(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OperatorError::SubprocessFailed("qemu-img".into(), String::from_utf8_lossy(&output.stderr).into_owned()))
        }
    }

    // --- MAC derivation --------------------------------------------------

    /// Deterministic locally-administered MAC: `52:54` OUI followed by the
    /// first six hex digits of `MD5(vm_id)` split into octet pairs, with a
    /// fixed trailing `00` octet.
    pub fn derive_mac(vm_id: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(vm_id.as_bytes());
        let digest = hasher.finalize();
        let hex = hex::encode(digest);
        format!("52:54:{}:{}:{}:00", &hex[0..2], &hex[2..4], &hex[4..6])
    }

    // --- process liveness -------------------------------------------------

    async fn read_pid(&self, vm_id: &str) -> Option<i32> {
        let contents = fs::read_to_string(self.pid_path(vm_id)).await.ok()?;
        contents.trim().parse().ok()
    }

    fn is_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    pub async fn is_running(&self, vm_id: &str) -> bool {
        match self.read_pid(vm_id).await {
            Some(pid) => Self::is_alive(pid),
            None => false,
        }
    }

    // --- start/stop --------------------------------------------------------

    pub async fn start_vm(
        &self,
        vm_id: &str,
        qcow2_path: Option<&Path>,
        cpu_count: u32,
        ram_gb: u32,
        network: &NetworkManager,
    ) -> Result<StartedVm, OperatorError> {
        if let Some(pid) = self.read_pid(vm_id).await {
            if Self::is_alive(pid) {
                return Err(OperatorError::VmAlreadyRunning(vm_id.to_string()));
            }
            debug!(vm_id, pid, "stale pid file found, cleaning up");
            let _ = fs::remove_file(self.pid_path(vm_id)).await;
        }

        let vm_dir = self.vm_dir(vm_id);
        fs::create_dir_all(&vm_dir).await?;
        let qmp_path = self.qmp_path(vm_id);
        let _ = fs::remove_file(&qmp_path).await;

        let root_disk = self.resolve_root_disk(vm_id, qcow2_path).await?;

        if self.dry_run {
            info!(vm_id, "dry-run: would spawn qemu");
            return Ok(StartedVm { local_ip: None, tap: None, mac: Self::derive_mac(vm_id) });
        }

        let network_result = self.acquire_network(vm_id, network).await;
        let (local_ip, tap, mac) = match network_result {
            Ok(result) => result,
            Err(e) => {
                warn!(vm_id, error = %e, "network acquisition failed, falling back to user-mode networking");
                (None, None, Self::derive_mac(vm_id))
            }
        };

        if let Err(e) = self.spawn_qemu(vm_id, &root_disk, cpu_count, ram_gb, tap.as_deref(), &mac).await {
            if let Some(tap) = &tap {
                network.delete_tap_interface(tap).await;
            }
            if let Some(ip) = local_ip {
                network.release_ip(ip).await;
            }
            return Err(e);
        }

        Ok(StartedVm { local_ip, tap, mac })
    }

    async fn resolve_root_disk(&self, vm_id: &str, qcow2_path: Option<&Path>) -> Result<PathBuf, OperatorError> {
        if let Some(path) = qcow2_path {
            return Ok(path.to_path_buf());
        }
        let private_root = self.vm_dir(vm_id).join("root.qcow2");
        if fs::try_exists(&private_root).await.unwrap_or(false) {
            return Ok(private_root);
        }
        if let Some(default_disk) = &self.default_boot_disk {
            if !self.dry_run {
                fs::copy(default_disk, &private_root).await?;
            }
        } else if !self.dry_run {
            self.qemu_img(&["create", "-f", "qcow2", &private_root.to_string_lossy(), &format!("{DEFAULT_ROOT_DISK_GB}G")]).await?;
        }
        Ok(private_root)
    }

    async fn acquire_network(
        &self,
        vm_id: &str,
        network: &NetworkManager,
    ) -> Result<(Option<std::net::Ipv4Addr>, Option<String>, String), OperatorError> {
        network.ensure_bridge().await?;
        let tap = network.create_tap_interface(vm_id).await?;
        if let Err(e) = fs::write(self.vm_dir(vm_id).join("tap.txt"), &tap).await {
            network.delete_tap_interface(&tap).await;
            return Err(e.into());
        }

        let preferred = fs::read_to_string(self.vm_dir(vm_id).join("ip.txt"))
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok());
        let ip = match network.allocate_ip(preferred).await {
            Ok(ip) => ip,
            Err(e) => {
                network.delete_tap_interface(&tap).await;
                let _ = fs::remove_file(self.vm_dir(vm_id).join("tap.txt")).await;
                return Err(e.into());
            }
        };
        if let Err(e) = fs::write(self.vm_dir(vm_id).join("ip.txt"), ip.to_string()).await {
            network.release_ip(ip).await;
            network.delete_tap_interface(&tap).await;
            let _ = fs::remove_file(self.vm_dir(vm_id).join("tap.txt")).await;
            return Err(e.into());
        }
        let mac = Self::derive_mac(vm_id);
        fs::write(self.vm_dir(vm_id).join("mac.txt"), &mac).await?;
        Ok((Some(ip), Some(tap), mac))
    }

    async fn spawn_qemu(
        &self,
        vm_id: &str,
        root_disk: &Path,
        cpu_count: u32,
        ram_gb: u32,
        tap: Option<&str>,
        mac: &str,
    ) -> Result<(), OperatorError> {
        let mut args: Vec<String> = vec![
            "-machine".into(),
            "q35,accel=kvm:tcg".into(),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            cpu_count.to_string(),
            "-m".into(),
            format!("{ram_gb}G"),
            "-drive".into(),
            format!("file={},if=virtio,id=drive0", root_disk.display()),
            "-qmp".into(),
            format!("unix:{},server,nowait", self.qmp_path(vm_id).display()),
            "-display".into(),
            "none".into(),
            "-no-reboot".into(),
            "-serial".into(),
            format!("file:{}", self.console_path(vm_id).display()),
            "-pidfile".into(),
            self.pid_path(vm_id).display().to_string(),
            "-daemonize".into(),
        ];

        match tap {
            Some(tap) => {
                args.push("-netdev".into());
                args.push(format!("tap,id=net0,ifname={tap},script=no,downscript=no"));
                args.push("-device".into());
                args.push(format!("virtio-net-pci,netdev=net0,mac={mac}"));
            }
            None => {
                args.push("-netdev".into());
                args.push("user,id=net0,hostfwd=tcp::0-:22".into());
                args.push("-device".into());
                args.push(format!("virtio-net-pci,netdev=net0,mac={mac}"));
            }
        }

        debug!(vm_id, args = ?args, "spawning qemu");
        let output = timeout(SPAWN_TIMEOUT, Command::new(&self.qemu_bin).args(&args).stdin(Stdio::null()).output())
            .await
            .map_err(|_| OperatorError::Timeout(format!("qemu spawn for {vm_id}")))??;
        if !output.status.success() {
            return Err(OperatorError::SubprocessFailed("qemu".into(), String::from_utf8_lossy(&output.stderr).into_owned()));
        }

        let deadline = tokio::time::Instant::now() + SPAWN_TIMEOUT;
        loop {
            if let Some(pid) = self.read_pid(vm_id).await {
                if Self::is_alive(pid) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OperatorError::Timeout(format!("qemu startup for {vm_id}")));
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn stop_vm(&self, vm_id: &str, force: bool, network: &NetworkManager) -> Result<(), OperatorError> {
        let Some(pid) = self.read_pid(vm_id).await else {
            return Ok(());
        };
        if !Self::is_alive(pid) {
            self.cleanup_after_stop(vm_id, network).await;
            return Ok(());
        }

        if !force {
            if let Ok(mut client) = QmpClient::connect(&self.qmp_path(vm_id)).await {
                let powerdown: Result<serde_json::Value, QmpError> = client.execute_no_args("system_powerdown").await;
                if powerdown.is_ok() && self.wait_for_exit(pid, POWERDOWN_TIMEOUT).await {
                    self.cleanup_after_stop(vm_id, network).await;
                    return Ok(());
                }
            }
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            if self.wait_for_exit(pid, SIGTERM_TIMEOUT).await {
                self.cleanup_after_stop(vm_id, network).await;
                return Ok(());
            }
        }

        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        self.wait_for_exit(pid, Duration::from_secs(5)).await;
        self.cleanup_after_stop(vm_id, network).await;
        Ok(())
    }

    async fn wait_for_exit(&self, pid: i32, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if !Self::is_alive(pid) {
                return true;
            }
            sleep(Duration::from_millis(200)).await;
        }
        !Self::is_alive(pid)
    }

    async fn cleanup_after_stop(&self, vm_id: &str, network: &NetworkManager) {
        let vm_dir = self.vm_dir(vm_id);
        if let Ok(tap) = fs::read_to_string(vm_dir.join("tap.txt")).await {
            network.delete_tap_interface(tap.trim()).await;
            let _ = fs::remove_file(vm_dir.join("tap.txt")).await;
        }
        if let Ok(ip) = fs::read_to_string(vm_dir.join("ip.txt")).await {
            if let Ok(ip) = ip.trim().parse() {
                network.release_ip(ip).await;
            }
        }
        let _ = fs::remove_file(self.pid_path(vm_id)).await;
        let _ = fs::remove_file(self.qmp_path(vm_id)).await;
    }

    // --- hot-plug / hot-unplug --------------------------------------------

    fn drive_id_for_device(device: &str) -> String {
        match device {
            "/dev/xvda" => "drive0".into(),
            "/dev/xvdb" => "drive1".into(),
            "/dev/xvdc" => "drive2".into(),
            "/dev/xvdd" => "drive3".into(),
            other => format!("drive-{}", other.replace('/', "-")),
        }
    }

    pub async fn attach_disk(&self, vm_id: &str, disk_path: &Path, device: &str) -> Result<(), OperatorError> {
        let drive_id = Self::drive_id_for_device(device);
        let mut client = QmpClient::connect(&self.qmp_path(vm_id)).await?;
        let blockdev_args = serde_json::json!({
            "driver": "qcow2",
            "node-name": drive_id,
            "file": { "driver": "file", "filename": disk_path.to_string_lossy() },
        });
        let _: serde_json::Value = client.execute("blockdev-add", blockdev_args).await?;

        let device_args = serde_json::json!({
            "driver": "virtio-blk-pci",
            "bus": "pcie.0",
            "drive": drive_id,
            "id": format!("virtio-{drive_id}"),
        });
        if let Err(e) = client.execute::<_, serde_json::Value>("device_add", device_args).await {
            let rollback = serde_json::json!({ "node-name": drive_id });
            let _: Result<serde_json::Value, QmpError> = client.execute("blockdev-del", rollback).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn detach_disk(&self, vm_id: &str, disk_path: &Path) -> Result<(), OperatorError> {
        let mut client = QmpClient::connect(&self.qmp_path(vm_id)).await?;
        let disk_path_str = disk_path.to_string_lossy().to_string();
        let device_id = Self::find_block_device(&mut client, &disk_path_str).await?;
        let args = serde_json::json!({ "id": device_id });
        let _: serde_json::Value = client.execute("device_del", args).await?;

        let deadline = tokio::time::Instant::now() + DETACH_POLL_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if Self::find_block_device(&mut client, &disk_path_str).await.is_err() {
                return Ok(());
            }
            sleep(DETACH_POLL_INTERVAL).await;
        }
        Err(OperatorError::Timeout(format!("detach of {disk_path_str}")))
    }

    async fn find_block_device(client: &mut QmpClient, disk_path: &str) -> Result<String, OperatorError> {
        let blocks: Vec<serde_json::Value> = client.execute_no_args("query-block").await?;
        for block in blocks {
            let inserted_file = block.get("inserted").and_then(|i| i.get("file")).and_then(|f| f.as_str());
            if inserted_file == Some(disk_path) {
                if let Some(device) = block.get("device").and_then(|d| d.as_str()) {
                    return Ok(device.to_string());
                }
            }
        }
        Err(OperatorError::DeviceNotFound(disk_path.to_string()))
    }

    // --- console log bounding ----------------------------------------------

    pub async fn truncate_console_if_needed(&self, vm_id: &str) -> Result<(), OperatorError> {
        let path = self.console_path(vm_id);
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() <= CONSOLE_MAX_BYTES {
            return Ok(());
        }
        let contents = fs::read(&path).await?;
        let tail = &contents[contents.len() - CONSOLE_MAX_BYTES as usize..];
        let mut file = fs::File::create(&path).await?;
        file.write_all(tail).await?;
        Ok(())
    }
}

pub struct StartedVm {
    pub local_ip: Option<std::net::Ipv4Addr>,
    pub tap: Option<String>,
    pub mac: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_deterministic_and_locally_administered() {
        let mac1 = Operator::derive_mac("vm-123");
        let mac2 = Operator::derive_mac("vm-123");
        let mac3 = Operator::derive_mac("vm-456");
        assert_eq!(mac1, mac2);
        assert_ne!(mac1, mac3);
        assert!(mac1.starts_with("52:54:"));
        assert!(mac1.ends_with(":00"));
    }

    #[test]
    fn drive_id_mapping() {
        assert_eq!(Operator::drive_id_for_device("/dev/xvda"), "drive0");
        assert_eq!(Operator::drive_id_for_device("/dev/xvdd"), "drive3");
        assert_eq!(Operator::drive_id_for_device("/dev/xvde"), "drive--dev-xvde");
    }
}

use std::{
    collections::HashSet,
    net::Ipv4Addr,
    path::Path,
    process::Stdio,
    time::Duration,
};

use serde::Serialize;
use tokio::{process::Command, sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid subnet '{0}'")]
    InvalidSubnet(String),

    #[error("subnet exhausted")]
    SubnetExhausted,

    #[error("command '{0}' timed out")]
    Timeout(String),

    #[error("command '{0}' failed: {1}")]
    CommandFailed(String, String),

    #[error("io error running '{0}': {1}")]
    Io(String, std::io::Error),
}

/// A parsed IPv4 CIDR block. Hand-rolled: no dedicated CIDR crate is carried
/// over from the teacher's dependency stack, and the arithmetic needed here
/// (network/broadcast/gateway bounds, host enumeration) is small enough that
/// pulling in a crate for it isn't worth the extra dependency.
#[derive(Debug, Clone, Copy)]
pub struct Subnet {
    network: u32,
    prefix_len: u8,
}

impl Subnet {
    pub fn parse(cidr: &str) -> Result<Self, NetworkError> {
        let (addr, len) = cidr.split_once('/').ok_or_else(|| NetworkError::InvalidSubnet(cidr.to_string()))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| NetworkError::InvalidSubnet(cidr.to_string()))?;
        let len: u8 = len.parse().map_err(|_| NetworkError::InvalidSubnet(cidr.to_string()))?;
        if len > 32 {
            return Err(NetworkError::InvalidSubnet(cidr.to_string()));
        }
        let mask = Self::mask(len);
        Ok(Self { network: u32::from(addr) & mask, prefix_len: len })
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) }
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !Self::mask(self.prefix_len))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix_len) == self.network
    }

    /// All host addresses in the subnet, excluding network and broadcast.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let network = self.network;
        let broadcast = u32::from(self.broadcast_address());
        ((network + 1)..broadcast).map(Ipv4Addr::from)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfigSnapshot {
    pub vlan_id: u16,
    pub bridge_name: String,
    pub subnet: String,
    pub gateway: String,
    pub dns: Vec<String>,
    pub allocated_ips: Vec<Ipv4Addr>,
    pub available_count: usize,
}

pub struct NetworkManager {
    vlan_id: u16,
    bridge_name: String,
    subnet: Subnet,
    subnet_text: String,
    gateway: Ipv4Addr,
    dns: Vec<String>,
    dry_run: bool,
    allocated_ips: Mutex<HashSet<Ipv4Addr>>,
}

const METADATA_LINK_LOCAL: &str = "169.254.169.254";

impl NetworkManager {
    pub fn new(
        vlan_id: u16,
        bridge_name: String,
        subnet_text: String,
        gateway: String,
        dns: Vec<String>,
        dry_run: bool,
    ) -> Result<Self, NetworkError> {
        let subnet = Subnet::parse(&subnet_text)?;
        let gateway: Ipv4Addr = gateway.parse().map_err(|_| NetworkError::InvalidSubnet(gateway.clone()))?;
        Ok(Self {
            vlan_id,
            bridge_name,
            subnet,
            subnet_text,
            gateway,
            dns,
            dry_run,
            allocated_ips: Mutex::new(HashSet::new()),
        })
    }

    /// Rebuilds the allocated-IP set from every per-VM `ip.txt` under
    /// `storage_root/vms/*`, so a restart doesn't reallocate an address a
    /// live VM directory already claims (spec.md §9 open question).
    pub async fn reload_from_storage(&self, storage_root: &Path) {
        let vms_dir = storage_root.join("vms");
        let Ok(mut entries) = tokio::fs::read_dir(&vms_dir).await else { return };
        let mut allocated = self.allocated_ips.lock().await;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let ip_path = entry.path().join("ip.txt");
            if let Ok(contents) = tokio::fs::read_to_string(&ip_path).await {
                if let Ok(ip) = contents.trim().parse::<Ipv4Addr>() {
                    allocated.insert(ip);
                }
            }
        }
    }

    fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.subnet.network_address() || ip == self.subnet.broadcast_address() || ip == self.gateway
    }

    pub async fn ensure_bridge(&self) -> Result<(), NetworkError> {
        if self.dry_run {
            info!(bridge = %self.bridge_name, "dry-run: would ensure bridge");
            return Ok(());
        }
        let exists = self.run(&["link", "show", &self.bridge_name]).await.is_ok();
        if !exists {
            self.run(&["link", "add", "name", &self.bridge_name, "type", "bridge"]).await?;
        }
        self.run(&["link", "set", "dev", &self.bridge_name, "up"]).await?;
        let prefix = format!("{}/{}", self.gateway, self.subnet_text.rsplit('/').next().unwrap_or("24"));
        self.run(&["addr", "add", &prefix, "dev", &self.bridge_name]).await.ok();
        if let Err(e) = self.run(&["addr", "add", &format!("{METADATA_LINK_LOCAL}/32"), "dev", &self.bridge_name]).await {
            warn!(error = %e, "failed to assign metadata link-local address to bridge");
        }
        Ok(())
    }

    pub async fn allocate_ip(&self, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr, NetworkError> {
        let mut allocated = self.allocated_ips.lock().await;
        if let Some(ip) = preferred {
            if self.subnet.contains(ip) && !self.is_reserved(ip) && !allocated.contains(&ip) {
                allocated.insert(ip);
                return Ok(ip);
            }
        }
        for ip in self.subnet.hosts() {
            if self.is_reserved(ip) || allocated.contains(&ip) {
                continue;
            }
            allocated.insert(ip);
            return Ok(ip);
        }
        Err(NetworkError::SubnetExhausted)
    }

    pub async fn release_ip(&self, ip: Ipv4Addr) {
        self.allocated_ips.lock().await.remove(&ip);
    }

    pub fn tap_name(vm_id: &str) -> String {
        format!("tap-{}", &vm_id.chars().take(8).collect::<String>())
    }

    pub async fn create_tap_interface(&self, vm_id: &str) -> Result<String, NetworkError> {
        let tap = Self::tap_name(vm_id);
        if self.dry_run {
            info!(%tap, "dry-run: would create tap interface");
            return Ok(tap);
        }
        self.run(&["tuntap", "add", "dev", &tap, "mode", "tap"]).await?;
        self.run(&["link", "set", "dev", &tap, "up"]).await?;
        self.run(&["link", "set", "dev", &tap, "master", &self.bridge_name]).await?;
        Ok(tap)
    }

    pub async fn delete_tap_interface(&self, tap: &str) {
        if self.dry_run {
            info!(%tap, "dry-run: would delete tap interface");
            return;
        }
        if let Err(e) = self.run(&["link", "set", "dev", tap, "nomaster"]).await {
            debug!(%tap, error = %e, "failed to unslave tap (ignored)");
        }
        if let Err(e) = self.run(&["link", "delete", tap]).await {
            debug!(%tap, error = %e, "failed to delete tap (ignored)");
        }
    }

    pub async fn config_snapshot(&self) -> NetworkConfigSnapshot {
        let allocated = self.allocated_ips.lock().await;
        let total_hosts = self.subnet.hosts().count();
        NetworkConfigSnapshot {
            vlan_id: self.vlan_id,
            bridge_name: self.bridge_name.clone(),
            subnet: self.subnet_text.clone(),
            gateway: self.gateway.to_string(),
            dns: self.dns.clone(),
            allocated_ips: allocated.iter().copied().collect(),
            available_count: total_hosts.saturating_sub(allocated.len() + 1),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, NetworkError> {
        let joined = format!("ip {}", args.join(" "));
        debug!(cmd = %joined, "running network command");
        let output = timeout(COMMAND_TIMEOUT, Command::new("ip").args(args).stdin(Stdio::null()).output())
            .await
            .map_err(|_| NetworkError::Timeout(joined.clone()))?
            .map_err(|e| NetworkError::Io(joined.clone(), e))?;
        if !output.status.success() {
            return Err(NetworkError::CommandFailed(joined, String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_bounds() {
        let subnet = Subnet::parse("192.168.100.0/24").unwrap();
        assert_eq!(subnet.network_address(), Ipv4Addr::new(192, 168, 100, 0));
        assert_eq!(subnet.broadcast_address(), Ipv4Addr::new(192, 168, 100, 255));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 100, 10)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 101, 10)));
    }

    #[tokio::test]
    async fn allocate_then_release() {
        let manager =
            NetworkManager::new(0, "vmanbr0".into(), "192.168.100.0/24".into(), "192.168.100.1".into(), vec![], true)
                .unwrap();
        let ip = manager.allocate_ip(None).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 100, 2));
        manager.release_ip(ip).await;
        let ip2 = manager.allocate_ip(None).await.unwrap();
        assert_eq!(ip2, ip);
    }

    #[tokio::test]
    async fn allocate_skips_reserved_and_allocated() {
        let manager =
            NetworkManager::new(0, "vmanbr0".into(), "192.168.100.0/24".into(), "192.168.100.1".into(), vec![], true)
                .unwrap();
        let first = manager.allocate_ip(None).await.unwrap();
        let second = manager.allocate_ip(None).await.unwrap();
        assert_ne!(first, second);
        assert_ne!(first, Ipv4Addr::new(192, 168, 100, 1));
    }

    #[tokio::test]
    async fn preferred_ip_reused_if_free() {
        let manager =
            NetworkManager::new(0, "vmanbr0".into(), "192.168.100.0/24".into(), "192.168.100.1".into(), vec![], true)
                .unwrap();
        let preferred = Ipv4Addr::new(192, 168, 100, 50);
        let ip = manager.allocate_ip(Some(preferred)).await.unwrap();
        assert_eq!(ip, preferred);
    }
}

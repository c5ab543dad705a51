//! Stable node identity.
//!
//! The id is computed once per `NodeIdentity` and then fixed for its
//! lifetime. Resolution order: configured override, hardware fingerprint
//! (primary interface MAC hashed with the cluster salt), previously persisted
//! id file, and finally a fresh random id that is written to the id file.

use if_addrs::IfAddr;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;

use crate::config::ClusterConfig;

/// How the node id was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Configured,
    Hardware,
    IdFile,
    Generated,
}

/// This process's identity within the cluster
pub struct NodeIdentity {
    config: ClusterConfig,
    resolved: OnceLock<(String, IdSource)>,
    mac: OnceLock<Option<String>>,
}

impl NodeIdentity {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            resolved: OnceLock::new(),
            mac: OnceLock::new(),
        }
    }

    /// The stable node id, computed on first use
    pub fn self_id(&self) -> &str {
        &self.resolved().0
    }

    /// Where the id came from
    pub fn source(&self) -> IdSource {
        self.resolved().1
    }

    /// Primary interface hardware address, if one could be read
    pub fn mac_identifier(&self) -> Option<&str> {
        self.mac.get_or_init(primary_mac_address).as_deref()
    }

    /// Address advertised to peers
    pub fn observable_address(&self) -> String {
        self.config.address.clone().unwrap_or_else(local_ip)
    }

    pub fn cluster_port(&self) -> u16 {
        self.config.port
    }

    fn resolved(&self) -> &(String, IdSource) {
        self.resolved.get_or_init(|| {
            let (id, source) = resolve_node_id(&self.config, self.mac_identifier());
            tracing::info!(node_id = %id, source = ?source, "Node identity resolved");
            (id, source)
        })
    }
}

/// Walk the fallback chain for a node id
pub fn resolve_node_id(config: &ClusterConfig, mac: Option<&str>) -> (String, IdSource) {
    if let Some(id) = config.node_id.as_deref().filter(|id| !id.trim().is_empty()) {
        return (id.trim().to_string(), IdSource::Configured);
    }

    if let Some(mac) = mac {
        return (fingerprint(mac, &config.salt), IdSource::Hardware);
    }

    if let Some(id) = read_id_file(&config.id_file) {
        return (id, IdSource::IdFile);
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    if let Err(e) = write_id_file(&config.id_file, &id) {
        tracing::warn!(
            path = ?config.id_file,
            error = %e,
            "Failed to persist generated node id; it will change on restart"
        );
    }
    (id, IdSource::Generated)
}

/// Hash a hardware address together with the cluster salt
pub fn fingerprint(mac: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(mac.trim().to_ascii_lowercase().as_bytes());
    hasher.finalize()[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn read_id_file(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let id = raw.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn write_id_file(path: &Path, id: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{id}\n"))
}

/// MAC of the first non-loopback interface, read from sysfs
fn primary_mac_address() -> Option<String> {
    let mut names: Vec<String> = if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.name)
        .collect();
    names.sort();
    names.dedup();

    names.into_iter().find_map(|name| {
        let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/address")).ok()?;
        let mac = raw.trim().to_ascii_lowercase();
        (!mac.is_empty() && mac != "00:00:00:00:00:00").then_some(mac)
    })
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

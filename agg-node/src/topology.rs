//! Static per-deployment tree description.
//!
//! Topology is immutable for the process lifetime: this host, its optional
//! parent, its children, and the deployment bounds. The node's role falls
//! out of the shape rather than being configured separately.

use std::net::Ipv4Addr;
use std::path::Path;

use agg_common::{ChildEntry, NodeConfig, Role, MAX_CHILDREN, MAX_WORKERS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One host in the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: u32,
    pub addr: Ipv4Addr,
    /// Link-layer address, `aa:bb:cc:dd:ee:ff`. Required for the parent and
    /// for children (the hooks rewrite frames toward them); for this host it
    /// defaults to the attach interface's address.
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Interface the hooks attach to.
    pub interface: String,
    /// Reserved destination the local sender targets; the egress hook
    /// rewrites it back to this host.
    #[serde(default = "default_sentinel")]
    pub sentinel: Ipv4Addr,
    pub host: HostSpec,
    #[serde(default)]
    pub parent: Option<HostSpec>,
    #[serde(default)]
    pub children: Vec<HostSpec>,
    /// Total contributing hosts in the deployment; bounds the dedup ids.
    pub worker_num: u32,
}

fn default_sentinel() -> Ipv4Addr {
    Ipv4Addr::new(198, 18, 0, 254)
}

/// Raw network-order representation, comparable against packet fields.
fn raw_v4(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

impl Topology {
    pub fn from_file(path: &Path) -> Result<Topology> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading topology {}", path.display()))?;
        let topology: Topology =
            serde_json::from_str(&text).context("parsing topology JSON")?;
        topology.validate()?;
        Ok(topology)
    }

    /// Role assigned once from the tree shape.
    pub fn role(&self) -> Role {
        match (&self.parent, self.children.is_empty()) {
            (None, _) => Role::Root,
            (Some(_), false) => Role::Aggregator,
            (Some(_), true) => Role::Worker,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_num == 0 || self.worker_num > MAX_WORKERS {
            bail!("worker_num must be in 1..={}", MAX_WORKERS);
        }
        if self.children.len() as u32 > MAX_CHILDREN {
            bail!("at most {} children per node", MAX_CHILDREN);
        }
        for host in self.hosts() {
            if host.id >= MAX_WORKERS {
                bail!("host id {} exceeds the dedup bitmap ({})", host.id, MAX_WORKERS);
            }
        }
        let mut ids: Vec<u32> = self.hosts().map(|h| h.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != 1 + self.parent.iter().count() + self.children.len() {
            bail!("duplicate host ids in topology");
        }
        if let Some(parent) = &self.parent {
            if parent.mac.is_none() {
                bail!("parent mac is required");
            }
        }
        for child in &self.children {
            if child.mac.is_none() {
                bail!("mac is required for child {}", child.id);
            }
        }
        Ok(())
    }

    fn hosts(&self) -> impl Iterator<Item = &HostSpec> {
        std::iter::once(&self.host)
            .chain(self.parent.iter())
            .chain(self.children.iter())
    }

    /// Kernel-side view of this node. The root points the parent fields at
    /// itself, which disables the upward-forward branch in the relay.
    pub fn node_config(&self, ifindex: u32, host_mac: [u8; 6]) -> Result<NodeConfig> {
        let (parent_id, parent_ip, parent_mac) = match &self.parent {
            Some(parent) => {
                let mac = parent.mac.as_deref().context("parent mac is required")?;
                (parent.id, raw_v4(parent.addr), parse_mac(mac)?)
            }
            None => (self.host.id, raw_v4(self.host.addr), host_mac),
        };
        Ok(NodeConfig {
            host_id: self.host.id,
            host_ip: raw_v4(self.host.addr),
            parent_id,
            parent_ip,
            sentinel_ip: raw_v4(self.sentinel),
            ifindex,
            children_num: self.children.len() as u32,
            role: self.role() as u32,
            xsk_redirect: 0,
            host_mac,
            parent_mac,
        })
    }

    /// Fan-out entries in hop-cursor order.
    pub fn child_entries(&self) -> Result<Vec<ChildEntry>> {
        self.children
            .iter()
            .map(|child| {
                let mac = child
                    .mac
                    .as_deref()
                    .with_context(|| format!("mac is required for child {}", child.id))?;
                Ok(ChildEntry {
                    ip: raw_v4(child.addr),
                    mac: parse_mac(mac)?,
                    _pad: [0; 2],
                })
            })
            .collect()
    }
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let parts: Vec<u8> = text
        .trim()
        .split(':')
        .filter_map(|s| u8::from_str_radix(s, 16).ok())
        .collect();

    if parts.len() != 6 {
        bail!("invalid MAC format: {}", text);
    }

    Ok([parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]])
}

/// Link-layer address of a local interface.
pub fn interface_mac(name: &str) -> Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", name);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading MAC from {}", path))?;
    parse_mac(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_json() -> &'static str {
        r#"{
            "interface": "ens3",
            "worker_num": 4,
            "host": { "id": 2, "addr": "10.0.0.3" },
            "parent": { "id": 0, "addr": "10.0.0.1", "mac": "02:00:00:00:00:01" }
        }"#
    }

    #[test]
    fn test_role_derivation() {
        let mut topology: Topology = serde_json::from_str(worker_json()).unwrap();
        assert_eq!(topology.role(), Role::Worker);

        topology.children.push(HostSpec {
            id: 3,
            addr: "10.0.0.4".parse().unwrap(),
            mac: Some("02:00:00:00:00:04".into()),
        });
        assert_eq!(topology.role(), Role::Aggregator);

        topology.parent = None;
        assert_eq!(topology.role(), Role::Root);
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        let mut topology: Topology = serde_json::from_str(worker_json()).unwrap();
        topology.host.id = MAX_WORKERS;
        assert!(topology.validate().is_err());

        let mut topology: Topology = serde_json::from_str(worker_json()).unwrap();
        topology.parent.as_mut().unwrap().id = topology.host.id;
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_validate_requires_child_macs() {
        let mut topology: Topology = serde_json::from_str(worker_json()).unwrap();
        topology.children.push(HostSpec {
            id: 3,
            addr: "10.0.0.4".parse().unwrap(),
            mac: None,
        });
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_node_config_is_network_order() {
        let topology: Topology = serde_json::from_str(worker_json()).unwrap();
        let mac = [2, 0, 0, 0, 0, 3];
        let cfg = topology.node_config(7, mac).unwrap();

        assert_eq!(cfg.host_ip, u32::from_ne_bytes([10, 0, 0, 3]));
        assert_eq!(cfg.parent_ip, u32::from_ne_bytes([10, 0, 0, 1]));
        assert_eq!(cfg.sentinel_ip, u32::from_ne_bytes([198, 18, 0, 254]));
        assert_eq!(cfg.ifindex, 7);
        assert_eq!(cfg.children_num, 0);
        assert_eq!(cfg.role, Role::Worker as u32);
        assert_eq!(cfg.parent_mac, [2, 0, 0, 0, 0, 1]);
        assert_eq!(cfg.xsk_redirect, 0);
    }

    #[test]
    fn test_root_points_parent_fields_at_itself() {
        let mut topology: Topology = serde_json::from_str(worker_json()).unwrap();
        topology.parent = None;
        let mac = [2, 0, 0, 0, 0, 3];
        let cfg = topology.node_config(1, mac).unwrap();
        assert_eq!(cfg.parent_id, cfg.host_id);
        assert_eq!(cfg.parent_ip, cfg.host_ip);
        assert_eq!(cfg.parent_mac, mac);
        assert_eq!(cfg.role, Role::Root as u32);
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:00:11:22").unwrap(),
            [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]
        );
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("not a mac").is_err());
    }

    #[test]
    fn test_child_entries_follow_list_order() {
        let mut topology: Topology = serde_json::from_str(worker_json()).unwrap();
        for i in 0..3u32 {
            topology.children.push(HostSpec {
                id: 10 + i,
                addr: Ipv4Addr::new(10, 0, 1, i as u8 + 1),
                mac: Some(format!("02:00:00:00:01:{:02x}", i + 1)),
            });
        }
        let entries = topology.child_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].ip, u32::from_ne_bytes([10, 0, 1, 2]));
        assert_eq!(entries[2].mac, [2, 0, 0, 0, 1, 3]);
    }
}

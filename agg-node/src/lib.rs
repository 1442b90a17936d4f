//! Userspace side of an aggregation tree node.
//!
//! Loads the kernel programs, writes the node's tree position into their
//! config maps, attaches the XDP aggregator and the two TC hooks, and pins
//! the fragment table for the consumer poller. Detach happens on drop.

pub mod poller;
pub mod sender;
pub mod table;
pub mod topology;

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use agg_common::{stat, ChildEntry, NodeConfig, TABLE_PIN_NAME};
use anyhow::{Context, Result};
use aya::{
    maps::{Array, PerCpuArray, XskMap},
    programs::{tc, SchedClassifier, TcAttachType, Xdp, XdpFlags},
    Ebpf,
};
use tracing::{debug, info, warn};

use crate::topology::Topology;

/// Default location of the compiled kernel object.
pub const DEFAULT_OBJ_PATH: &str = "agg-ebpf/target/bpfel-unknown-none/release/agg-ebpf";

/// Default bpffs directory for the pinned fragment table.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf";

/// Kernel-side outcome counters, summed across CPUs.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub seen: u64,
    pub accepted: u64,
    pub duplicate: u64,
    pub stale: u64,
    pub busy: u64,
    pub malformed: u64,
    pub finalized: u64,
    pub absorbed: u64,
    pub forwarded_up: u64,
    pub relay_hops: u64,
    pub relay_done: u64,
    pub local_redirects: u64,
}

/// A node with its three hooks live on the configured interface.
pub struct AggNode {
    bpf: Ebpf,
    interface: String,
    pin_path: PathBuf,
}

impl AggNode {
    /// Load the kernel object, program the topology maps, attach all three
    /// hooks and pin the fragment table.
    pub fn attach(topology: &Topology, obj_path: &Path, pin_dir: &Path) -> Result<AggNode> {
        topology.validate()?;

        let mut bpf = Ebpf::load_file(obj_path)
            .with_context(|| format!("loading kernel object {}", obj_path.display()))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            debug!("eBPF logger not available: {}", e);
        }

        let ifindex = ifindex(&topology.interface)?;
        let host_mac = match topology.host.mac.as_deref() {
            Some(mac) => topology::parse_mac(mac)?,
            None => topology::interface_mac(&topology.interface)?,
        };

        {
            let mut config: Array<_, NodeConfig> = bpf
                .map_mut("NODE_CONFIG")
                .context("NODE_CONFIG map not found")?
                .try_into()?;
            config.set(0, topology.node_config(ifindex, host_mac)?, 0)?;
        }
        {
            let mut children: Array<_, ChildEntry> = bpf
                .map_mut("CHILDREN")
                .context("CHILDREN map not found")?
                .try_into()?;
            for (i, entry) in topology.child_entries()?.into_iter().enumerate() {
                children.set(i as u32, entry, 0)?;
            }
        }

        // SKB mode keeps ingress-redirected copies flowing back through the
        // aggregator (generic XDP runs in the skb receive path).
        let aggregator: &mut Xdp = bpf
            .program_mut("aggregator")
            .context("aggregator program not found")?
            .try_into()?;
        aggregator.load().context("loading XDP aggregator")?;
        aggregator
            .attach(&topology.interface, XdpFlags::SKB_MODE)
            .with_context(|| format!("attaching aggregator to {}", topology.interface))?;
        info!("aggregator attached to {} (skb mode)", topology.interface);

        // The qdisc may already exist on the device.
        let _ = tc::qdisc_add_clsact(&topology.interface);

        let relay: &mut SchedClassifier = bpf
            .program_mut("relay")
            .context("relay program not found")?
            .try_into()?;
        relay.load().context("loading relay")?;
        relay
            .attach(&topology.interface, TcAttachType::Ingress)
            .context("attaching relay at ingress")?;

        let local: &mut SchedClassifier = bpf
            .program_mut("local_deliver")
            .context("local_deliver program not found")?
            .try_into()?;
        local.load().context("loading local_deliver")?;
        local
            .attach(&topology.interface, TcAttachType::Egress)
            .context("attaching local_deliver at egress")?;
        info!("relay (ingress) and local_deliver (egress) attached");

        // Re-pin the fragment table, dropping any stale pin from a previous
        // run so the poller never opens a dead map.
        let pin_path = pin_dir.join(TABLE_PIN_NAME);
        if pin_path.exists() {
            warn!("removing stale table pin {}", pin_path.display());
            std::fs::remove_file(&pin_path)
                .with_context(|| format!("unpinning {}", pin_path.display()))?;
        }
        bpf.map_mut("FRAG_TABLE")
            .context("FRAG_TABLE map not found")?
            .pin(&pin_path)
            .with_context(|| format!("pinning fragment table at {}", pin_path.display()))?;
        info!("fragment table pinned at {}", pin_path.display());

        Ok(AggNode {
            bpf,
            interface: topology.interface.clone(),
            pin_path,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn pin_path(&self) -> &Path {
        &self.pin_path
    }

    /// Snapshot the kernel-side outcome counters.
    pub fn stats(&self) -> Result<NodeStats> {
        let stats: PerCpuArray<_, u64> = self
            .bpf
            .map("STATS")
            .context("STATS map not found")?
            .try_into()?;
        let read = |idx: u32| -> u64 {
            stats
                .get(&idx, 0)
                .map(|values| values.iter().sum())
                .unwrap_or(0)
        };
        Ok(NodeStats {
            seen: read(stat::SEEN),
            accepted: read(stat::ACCEPTED),
            duplicate: read(stat::DUPLICATE),
            stale: read(stat::STALE),
            busy: read(stat::BUSY),
            malformed: read(stat::MALFORMED),
            finalized: read(stat::FINALIZED),
            absorbed: read(stat::ABSORBED),
            forwarded_up: read(stat::FORWARDED_UP),
            relay_hops: read(stat::RELAY_HOPS),
            relay_done: read(stat::RELAY_DONE),
            local_redirects: read(stat::LOCAL_REDIRECTS),
        })
    }

    /// Register an AF_XDP socket for the optional zero-copy delivery path.
    pub fn register_xsk<S: AsRawFd>(&mut self, queue_id: u32, socket: &S) -> Result<()> {
        let mut xsks: XskMap<_> = self
            .bpf
            .map_mut("XSKS")
            .context("XSKS map not found")?
            .try_into()?;
        xsks.set(queue_id, socket.as_raw_fd(), 0)?;
        info!("XSK socket registered for queue {}", queue_id);
        Ok(())
    }

    /// Steer completed upward forwards into the registered XSK sockets
    /// instead of the regular stack. Off unless a deployment enables it.
    pub fn set_xsk_redirect(&mut self, enable: bool) -> Result<()> {
        let mut config: Array<_, NodeConfig> = self
            .bpf
            .map_mut("NODE_CONFIG")
            .context("NODE_CONFIG map not found")?
            .try_into()?;
        let mut cfg = config.get(&0, 0)?;
        cfg.xsk_redirect = enable as u32;
        config.set(0, cfg, 0)?;
        info!("zero-copy redirect {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }
}

impl Drop for AggNode {
    fn drop(&mut self) {
        // aya detaches the programs; the pin has to go by hand.
        info!("detaching aggregation hooks from {}", self.interface);
        if let Err(e) = std::fs::remove_file(&self.pin_path) {
            debug!("table pin not removed: {}", e);
        }
    }
}

/// Interface index for a device name.
fn ifindex(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name)?;
    let idx = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if idx == 0 {
        anyhow::bail!("interface {} not found", name);
    }
    Ok(idx)
}

//! Shared definitions for the in-network gradient aggregation tree.
//!
//! This crate is compiled both for the BPF target (kernel programs) and for
//! the host (loader, poller, sender, tests), so everything in it is
//! `no_std`-capable. The `user` feature adds the `aya::Pod` impls the
//! userspace map API needs.

#![cfg_attr(not(feature = "user"), no_std)]

pub mod csum;
pub mod slot;
pub mod wire;

pub use slot::{FragmentSlot, SubmitOutcome};
pub use wire::AggPayload;

/// Number of independently aggregated fragments per gradient round.
pub const FRAGMENT_SIZE: usize = 256;

/// i32 lanes per fragment. Capped by the 512-byte BPF program stack: the
/// aggregator hook stages one contribution on the stack before submitting it.
pub const GRADIENT_SIZE: usize = 64;

/// Width of the per-slot dedup bitmap; host ids must stay below this.
pub const MAX_WORKERS: u32 = 64;

/// Upper bound on fan-out children per node.
pub const MAX_CHILDREN: u32 = 16;

/// Well-known UDP port the aggregation payloads travel on.
pub const AGG_PORT: u16 = 50100;

/// Name the fragment table is pinned under, below the bpffs base directory.
pub const TABLE_PIN_NAME: &str = "agg_frag_table";

/// Node role, assigned once from topology configuration.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Leaf: contributes its own gradients, forwards subtree results up.
    Worker = 0,
    /// Interior node: aggregates a subtree, relays the broadcast down.
    Aggregator = 1,
    /// Parent server: closes each round and starts the downward fan-out.
    Root = 2,
}

impl Role {
    pub fn from_u32(v: u32) -> Role {
        match v {
            1 => Role::Aggregator,
            2 => Role::Root,
            _ => Role::Worker,
        }
    }
}

/// Per-node configuration the loader writes into the `NODE_CONFIG` map
/// before the programs attach. Read-only to the kernel side.
///
/// Addresses are raw network byte order, comparable against packet fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub host_id: u32,
    pub host_ip: u32,
    pub parent_id: u32,
    pub parent_ip: u32,
    pub sentinel_ip: u32,
    pub ifindex: u32,
    pub children_num: u32,
    pub role: u32,
    /// Nonzero routes completed upward forwards into the XSK socket map
    /// instead of the regular stack. Off by default.
    pub xsk_redirect: u32,
    pub host_mac: [u8; 6],
    pub parent_mac: [u8; 6],
}

/// One fan-out target, indexed by the payload's hop cursor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChildEntry {
    pub ip: u32,
    pub mac: [u8; 6],
    pub _pad: [u8; 2],
}

/// Which child the current fan-out hop targets, or `None` once every child
/// has been reached and the relay chain ends.
#[inline(always)]
pub fn next_hop(bcast: u32, children_num: u32) -> Option<u32> {
    if bcast >= children_num {
        None
    } else {
        Some(bcast)
    }
}

/// Indices into the per-CPU `STATS` array map.
pub mod stat {
    /// Matching payloads inspected.
    pub const SEEN: u32 = 0;
    pub const ACCEPTED: u32 = 1;
    pub const DUPLICATE: u32 = 2;
    pub const STALE: u32 = 3;
    pub const BUSY: u32 = 4;
    pub const MALFORMED: u32 = 5;
    /// Rounds closed on this node (root finalize).
    pub const FINALIZED: u32 = 6;
    /// Parent broadcasts taken as this node's aggregate.
    pub const ABSORBED: u32 = 7;
    /// Subtree results rewritten toward the parent.
    pub const FORWARDED_UP: u32 = 8;
    /// Fan-out hops relayed.
    pub const RELAY_HOPS: u32 = 9;
    /// Fan-out chains terminated (all children reached).
    pub const RELAY_DONE: u32 = 10;
    /// Sentinel-addressed packets bounced into our own ingress.
    pub const LOCAL_REDIRECTS: u32 = 11;

    /// Size of the stats map.
    pub const COUNT: u32 = 16;
}

#[cfg(feature = "user")]
mod pod {
    unsafe impl aya::Pod for crate::NodeConfig {}
    unsafe impl aya::Pod for crate::ChildEntry {}
    unsafe impl aya::Pod for crate::FragmentSlot {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_chain_terminates() {
        // Two children: hops 0 and 1 relay, hop 2 ends the chain.
        assert_eq!(next_hop(0, 2), Some(0));
        assert_eq!(next_hop(1, 2), Some(1));
        assert_eq!(next_hop(2, 2), None);
        assert_eq!(next_hop(7, 2), None);
        // A leaf relays nothing.
        assert_eq!(next_hop(0, 0), None);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Worker, Role::Aggregator, Role::Root] {
            assert_eq!(Role::from_u32(role as u32), role);
        }
        assert_eq!(Role::from_u32(99), Role::Worker);
    }
}

//! Kernel-side programs for the gradient aggregation tree.
//!
//! Three hooks run on every node:
//! - `aggregator` (XDP): classifies aggregation payloads and drives the
//!   per-fragment state machine in the pinned table.
//! - `relay` (TC ingress): forwards completed subtree results toward the
//!   parent and performs the sequential child fan-out.
//! - `local_deliver` (TC egress): bounces sentinel-addressed datagrams into
//!   the host's own ingress path.
//!
//! Attach XDP in SKB mode: ingress-redirected copies re-enter through
//! generic XDP, which is what keeps the relay chain and local delivery
//! flowing through the aggregator.

#![no_std]
#![no_main]

use core::mem;

use agg_common::{
    csum::csum_replace4,
    next_hop, stat,
    wire::{OFF_BCAST, OFF_FRAGMENT_ID, OFF_GRADS, OFF_HOST_ID, OFF_ROUND},
    AggPayload, ChildEntry, FragmentSlot, NodeConfig, Role, SubmitOutcome, AGG_PORT,
    FRAGMENT_SIZE, GRADIENT_SIZE, MAX_CHILDREN, MAX_WORKERS,
};
use aya_ebpf::{
    bindings::{xdp_action, BPF_F_INGRESS, BPF_F_PSEUDO_HDR, TC_ACT_OK, TC_ACT_SHOT},
    helpers::gen::bpf_redirect,
    macros::{classifier, map, xdp},
    maps::{Array, PerCpuArray, XskMap},
    programs::{TcContext, XdpContext},
};

/// Shared per-fragment aggregation table; the loader pins this so the
/// consumer poller can open it by path.
#[map]
static FRAG_TABLE: Array<FragmentSlot> = Array::with_max_entries(FRAGMENT_SIZE as u32, 0);

/// Node identity and tree position, written once at attach time.
#[map]
static NODE_CONFIG: Array<NodeConfig> = Array::with_max_entries(1, 0);

/// Fan-out targets, indexed by the payload hop cursor.
#[map]
static CHILDREN: Array<ChildEntry> = Array::with_max_entries(MAX_CHILDREN, 0);

/// Outcome counters (per-CPU for lock-free updates); indices in
/// `agg_common::stat`.
#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(stat::COUNT, 0);

/// Zero-copy delivery sockets; only consulted when
/// `NodeConfig::xsk_redirect` is set.
#[map]
static XSKS: XskMap = XskMap::with_max_entries(64, 0);

const ETH_HDR_LEN: usize = 14;
const IP_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
const ETH_P_IP: u16 = 0x0800;
const IPPROTO_UDP: u8 = 17;

const IP_CSUM_OFF: usize = ETH_HDR_LEN + 10;
const IP_SADDR_OFF: usize = ETH_HDR_LEN + 12;
const IP_DADDR_OFF: usize = ETH_HDR_LEN + 16;
const UDP_DEST_OFF: usize = ETH_HDR_LEN + IP_HDR_LEN + 2;
const UDP_CSUM_OFF: usize = ETH_HDR_LEN + IP_HDR_LEN + 6;
const PAYLOAD_OFF: usize = ETH_HDR_LEN + IP_HDR_LEN + UDP_HDR_LEN;

#[inline(always)]
fn bump(idx: u32) {
    if let Some(counter) = STATS.get_ptr_mut(idx) {
        unsafe { *counter += 1 };
    }
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + mem::size_of::<T>() > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[inline(always)]
fn ptr_at_mut<T>(ctx: &XdpContext, offset: usize) -> Result<*mut T, ()> {
    Ok(ptr_at::<T>(ctx, offset)? as *mut T)
}

// =============================================================================
// XDP: fragment aggregation
// =============================================================================

#[xdp]
pub fn aggregator(ctx: XdpContext) -> u32 {
    match try_aggregator(ctx) {
        Ok(ret) => ret,
        Err(_) => xdp_action::XDP_PASS,
    }
}

#[inline(always)]
fn try_aggregator(ctx: XdpContext) -> Result<u32, ()> {
    // Non-matching traffic passes untouched.
    let eth_proto = u16::from_be(unsafe { *ptr_at(&ctx, 12)? });
    if eth_proto != ETH_P_IP {
        return Ok(xdp_action::XDP_PASS);
    }
    let version_ihl: u8 = unsafe { *ptr_at(&ctx, ETH_HDR_LEN)? };
    if version_ihl != 0x45 {
        // IP options would shift every offset below; the protocol never
        // sends them.
        return Ok(xdp_action::XDP_PASS);
    }
    let ip_proto: u8 = unsafe { *ptr_at(&ctx, ETH_HDR_LEN + 9)? };
    if ip_proto != IPPROTO_UDP {
        return Ok(xdp_action::XDP_PASS);
    }
    let dest_port = u16::from_be(unsafe { *ptr_at(&ctx, UDP_DEST_OFF)? });
    if dest_port != AGG_PORT {
        return Ok(xdp_action::XDP_PASS);
    }

    bump(stat::SEEN);
    let cfg = *NODE_CONFIG.get(0).ok_or(())?;

    // A payload on our port that is too short is dropped outright.
    if ptr_at::<u8>(&ctx, PAYLOAD_OFF + AggPayload::WIRE_LEN - 1).is_err() {
        bump(stat::MALFORMED);
        return Ok(xdp_action::XDP_DROP);
    }

    let host_id = u32::from_be(unsafe { *ptr_at(&ctx, PAYLOAD_OFF + OFF_HOST_ID)? });
    let frag_id = u32::from_be(unsafe { *ptr_at(&ctx, PAYLOAD_OFF + OFF_FRAGMENT_ID)? });
    let bcast = u32::from_be(unsafe { *ptr_at(&ctx, PAYLOAD_OFF + OFF_BCAST)? });
    let round = u32::from_be(unsafe { *ptr_at(&ctx, PAYLOAD_OFF + OFF_ROUND)? });
    let saddr: u32 = unsafe { *ptr_at(&ctx, IP_SADDR_OFF)? };

    // Already in fan-out and echoed back through our own ingress; the relay
    // takes it from here.
    if bcast > 0 && saddr == cfg.host_ip {
        return Ok(xdp_action::XDP_PASS);
    }

    if host_id >= MAX_WORKERS || frag_id >= FRAGMENT_SIZE as u32 {
        bump(stat::MALFORMED);
        return Ok(xdp_action::XDP_DROP);
    }

    let slot = unsafe { &mut *FRAG_TABLE.get_ptr_mut(frag_id).ok_or(())? };

    if slot.round != round {
        bump(stat::STALE);
        return Ok(xdp_action::XDP_DROP);
    }

    // One staging copy of the payload vector serves both the submit and the
    // absorb paths; a second array would not fit the program stack.
    let mut grads = [0i32; GRADIENT_SIZE];
    for (i, lane) in grads.iter_mut().enumerate() {
        let raw: u32 = unsafe { *ptr_at(&ctx, PAYLOAD_OFF + OFF_GRADS + i * 4)? };
        *lane = u32::from_be(raw) as i32;
    }

    // Accumulation phase. The parent's broadcast skips this: the slot is
    // already sitting at the threshold from our own upward forward.
    if slot.arrivals <= cfg.children_num {
        match slot.submit(host_id, round, &grads) {
            SubmitOutcome::Accepted => bump(stat::ACCEPTED),
            SubmitOutcome::Duplicate => {
                bump(stat::DUPLICATE);
                return Ok(xdp_action::XDP_DROP);
            }
            SubmitOutcome::StaleRound => {
                bump(stat::STALE);
                return Ok(xdp_action::XDP_DROP);
            }
            SubmitOutcome::Busy => {
                bump(stat::BUSY);
                return Ok(xdp_action::XDP_DROP);
            }
        }
    }

    if !slot.is_complete(cfg.children_num) {
        // Consumed into the accumulator.
        return Ok(xdp_action::XDP_DROP);
    }

    // Completion. Every payload leaving this node carries our id.
    unsafe {
        *ptr_at_mut::<u32>(&ctx, PAYLOAD_OFF + OFF_HOST_ID)? = cfg.host_id.to_be();
    }

    if cfg.role == Role::Root as u32 {
        // The accumulator becomes this round's broadcast.
        slot.finalize_root();
        write_payload_grads(&ctx, &slot.agg)?;
        unsafe { *ptr_at_mut::<u32>(&ctx, PAYLOAD_OFF + OFF_BCAST)? = 0 };
        clear_udp_csum(&ctx)?;
        bump(stat::FINALIZED);
        return Ok(xdp_action::XDP_PASS);
    }

    if host_id == cfg.parent_id {
        // The broadcast coming down: take it as our aggregate; the relay
        // then fans it out to our own children with a fresh hop cursor.
        slot.absorb_broadcast(&grads);
        unsafe { *ptr_at_mut::<u32>(&ctx, PAYLOAD_OFF + OFF_BCAST)? = 0 };
        clear_udp_csum(&ctx)?;
        bump(stat::ABSORBED);
        return Ok(xdp_action::XDP_PASS);
    }

    // Subtree complete: carry the accumulator upward. The slot stays at the
    // threshold until the broadcast returns.
    write_payload_grads(&ctx, &slot.acc)?;

    let old_daddr: u32 = unsafe { *ptr_at(&ctx, IP_DADDR_OFF)? };
    patch_ip_csum(&ctx, saddr, cfg.host_ip)?;
    patch_ip_csum(&ctx, old_daddr, cfg.parent_ip)?;
    unsafe {
        *ptr_at_mut::<u32>(&ctx, IP_SADDR_OFF)? = cfg.host_ip;
        *ptr_at_mut::<u32>(&ctx, IP_DADDR_OFF)? = cfg.parent_ip;
    }
    for i in 0..6 {
        unsafe {
            *ptr_at_mut::<u8>(&ctx, i)? = cfg.parent_mac[i];
            *ptr_at_mut::<u8>(&ctx, 6 + i)? = cfg.host_mac[i];
        }
    }
    clear_udp_csum(&ctx)?;
    bump(stat::FORWARDED_UP);

    if cfg.xsk_redirect != 0 {
        // Zero-copy delivery takes over on the queue the packet arrived on.
        let queue = unsafe { (*ctx.ctx).rx_queue_index };
        if let Ok(action) = XSKS.redirect(queue, 0) {
            return Ok(action);
        }
    }

    // The relay redirects parent-addressed packets out the wire.
    Ok(xdp_action::XDP_PASS)
}

/// Overwrite the payload gradient vector in place, network byte order.
#[inline(always)]
fn write_payload_grads(ctx: &XdpContext, grads: &[i32; GRADIENT_SIZE]) -> Result<(), ()> {
    for (i, lane) in grads.iter().enumerate() {
        unsafe {
            *ptr_at_mut::<u32>(ctx, PAYLOAD_OFF + OFF_GRADS + i * 4)? = (*lane as u32).to_be();
        }
    }
    Ok(())
}

/// Incrementally fold one rewritten 32-bit word into the IPv4 header
/// checksum. `old`/`new` are raw network-order words.
#[inline(always)]
fn patch_ip_csum(ctx: &XdpContext, old: u32, new: u32) -> Result<(), ()> {
    let csum_ptr = ptr_at_mut::<u16>(ctx, IP_CSUM_OFF)?;
    let old_csum = u16::from_be(unsafe { *csum_ptr });
    let new_csum = csum_replace4(old_csum, u32::from_be(old), u32::from_be(new));
    unsafe { *csum_ptr = new_csum.to_be() };
    Ok(())
}

/// The UDP checksum is optional over IPv4; paths that rewrite the gradient
/// vector disable it rather than refold the whole payload.
#[inline(always)]
fn clear_udp_csum(ctx: &XdpContext) -> Result<(), ()> {
    unsafe { *ptr_at_mut::<u16>(ctx, UDP_CSUM_OFF)? = 0 };
    Ok(())
}

// =============================================================================
// TC ingress: upward forward + sequential fan-out
// =============================================================================

#[classifier]
pub fn relay(ctx: TcContext) -> i32 {
    match try_relay(ctx) {
        Ok(ret) => ret,
        Err(_) => TC_ACT_OK,
    }
}

#[inline(always)]
fn try_relay(mut ctx: TcContext) -> Result<i32, ()> {
    if !is_agg_datagram(&ctx)? {
        return Ok(TC_ACT_OK);
    }
    if (ctx.skb.len() as usize) < PAYLOAD_OFF + AggPayload::WIRE_LEN {
        bump(stat::MALFORMED);
        return Ok(TC_ACT_SHOT);
    }

    let cfg = *NODE_CONFIG.get(0).ok_or(())?;
    let daddr: u32 = ctx.skb.load(IP_DADDR_OFF).map_err(|_| ())?;

    // A completed subtree result on its way up.
    if daddr == cfg.parent_ip && cfg.parent_ip != cfg.host_ip {
        return Ok(unsafe { bpf_redirect(cfg.ifindex, 0) } as i32);
    }

    let bcast_be: u32 = ctx.skb.load(PAYLOAD_OFF + OFF_BCAST).map_err(|_| ())?;
    let bcast = u32::from_be(bcast_be);
    let hop = match next_hop(bcast, cfg.children_num) {
        Some(hop) => hop,
        None => {
            // All children reached; the chain ends here.
            bump(stat::RELAY_DONE);
            return Ok(TC_ACT_SHOT);
        }
    };

    let child = *CHILDREN.get(hop).ok_or(())?;
    let saddr: u32 = ctx.skb.load(IP_SADDR_OFF).map_err(|_| ())?;
    let new_bcast_be: u32 = (bcast + 1).to_be();

    // Checksums are patched, never refolded: addresses count into both the
    // IPv4 header sum and the UDP pseudo-header, the hop cursor only into
    // the UDP sum. A zero UDP checksum means "disabled" and stays zero.
    let udp_csum: u16 = ctx.skb.load(UDP_CSUM_OFF).map_err(|_| ())?;
    if udp_csum != 0 {
        let pseudo = BPF_F_PSEUDO_HDR as u64 | 4;
        ctx.skb
            .l4_csum_replace(UDP_CSUM_OFF, saddr as u64, cfg.host_ip as u64, pseudo)
            .map_err(|_| ())?;
        ctx.skb
            .l4_csum_replace(UDP_CSUM_OFF, daddr as u64, child.ip as u64, pseudo)
            .map_err(|_| ())?;
        ctx.skb
            .l4_csum_replace(UDP_CSUM_OFF, bcast_be as u64, new_bcast_be as u64, 4)
            .map_err(|_| ())?;
    }
    ctx.skb
        .l3_csum_replace(IP_CSUM_OFF, saddr as u64, cfg.host_ip as u64, 4)
        .map_err(|_| ())?;
    ctx.skb
        .l3_csum_replace(IP_CSUM_OFF, daddr as u64, child.ip as u64, 4)
        .map_err(|_| ())?;

    ctx.skb.store(IP_SADDR_OFF, &cfg.host_ip, 0).map_err(|_| ())?;
    ctx.skb.store(IP_DADDR_OFF, &child.ip, 0).map_err(|_| ())?;
    ctx.skb
        .store(PAYLOAD_OFF + OFF_BCAST, &new_bcast_be, 0)
        .map_err(|_| ())?;
    ctx.skb.store(0, &child.mac, 0).map_err(|_| ())?;
    ctx.skb.store(6, &cfg.host_mac, 0).map_err(|_| ())?;

    bump(stat::RELAY_HOPS);

    // Two emissions per hop: the clone re-enters our own ingress to drive
    // the next hop, the rewritten original continues to the selected child.
    let _ = ctx.skb.clone_redirect(cfg.ifindex, BPF_F_INGRESS as u64);
    Ok(unsafe { bpf_redirect(cfg.ifindex, 0) } as i32)
}

// =============================================================================
// TC egress: sentinel rewrite into our own ingress
// =============================================================================

#[classifier]
pub fn local_deliver(ctx: TcContext) -> i32 {
    match try_local_deliver(ctx) {
        Ok(ret) => ret,
        Err(_) => TC_ACT_OK,
    }
}

#[inline(always)]
fn try_local_deliver(mut ctx: TcContext) -> Result<i32, ()> {
    if !is_agg_datagram(&ctx)? {
        return Ok(TC_ACT_OK);
    }

    let cfg = *NODE_CONFIG.get(0).ok_or(())?;
    let daddr: u32 = ctx.skb.load(IP_DADDR_OFF).map_err(|_| ())?;
    if daddr != cfg.sentinel_ip {
        return Ok(TC_ACT_OK);
    }

    let udp_csum: u16 = ctx.skb.load(UDP_CSUM_OFF).map_err(|_| ())?;
    if udp_csum != 0 {
        ctx.skb
            .l4_csum_replace(
                UDP_CSUM_OFF,
                daddr as u64,
                cfg.host_ip as u64,
                BPF_F_PSEUDO_HDR as u64 | 4,
            )
            .map_err(|_| ())?;
    }
    ctx.skb
        .l3_csum_replace(IP_CSUM_OFF, daddr as u64, cfg.host_ip as u64, 4)
        .map_err(|_| ())?;
    ctx.skb.store(IP_DADDR_OFF, &cfg.host_ip, 0).map_err(|_| ())?;

    bump(stat::LOCAL_REDIRECTS);
    Ok(unsafe { bpf_redirect(cfg.ifindex, BPF_F_INGRESS as u64) } as i32)
}

/// UDP/IPv4 datagram on the aggregation port, headers in bounds.
#[inline(always)]
fn is_agg_datagram(ctx: &TcContext) -> Result<bool, ()> {
    let eth_proto: u16 = ctx.skb.load(12).map_err(|_| ())?;
    if u16::from_be(eth_proto) != ETH_P_IP {
        return Ok(false);
    }
    let version_ihl: u8 = ctx.skb.load(ETH_HDR_LEN).map_err(|_| ())?;
    if version_ihl != 0x45 {
        return Ok(false);
    }
    let ip_proto: u8 = ctx.skb.load(ETH_HDR_LEN + 9).map_err(|_| ())?;
    if ip_proto != IPPROTO_UDP {
        return Ok(false);
    }
    let dest_port: u16 = ctx.skb.load(UDP_DEST_OFF).map_err(|_| ())?;
    Ok(u16::from_be(dest_port) == AGG_PORT)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

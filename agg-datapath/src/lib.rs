//! Zero-copy packet datapath over AF_XDP.
//!
//! Frame memory lives in a shared UMEM arena owned by [`xsk::UmemPool`];
//! descriptors move between four single-producer/single-consumer rings
//! (receive, transmit, fill, completion) mapped from the socket. The
//! receive loop hands each frame to a [`FrameHandler`]; handlers either
//! resubmit the frame for transmission or return it to the pool.
//!
//! This is the ancillary fast path of the aggregation node: the XDP hook
//! can steer completed upward forwards into these sockets when the
//! deployment enables the redirect flag. No deployment does yet; the
//! default handler is a UDP echo used for connectivity and rate testing.

pub mod xsk;

pub use xsk::{UmemPool, XskConfig, XskSocket};

use std::time::Instant;

/// What to do with a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Queue the frame for transmission with this length; ownership moves
    /// to the transmit ring.
    Transmit(u32),
    /// Return the frame to the pool.
    Release,
}

/// Per-frame callback on the receive path.
pub trait FrameHandler {
    fn handle(&mut self, frame: &mut [u8]) -> Verdict;
}

/// Result of pushing a finalized packet into a delivery sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    Accepted,
    /// The sink is out of frames or ring space; the caller keeps ownership.
    Backpressure,
}

/// Delivery interface for finalized aggregation packets. The engine pushes
/// into whatever sink a deployment enables; [`XskSocket`] implements it
/// over the transmit ring.
pub trait FinalizedSink {
    fn deliver(&mut self, frame: &[u8]) -> DeliverStatus;
}

/// Placeholder frame handler: echoes UDP datagrams back to their sender by
/// swapping link, network and transport addressing in place.
pub struct UdpEchoHandler;

const ETH_HDR_LEN: usize = 14;
const IP_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

impl FrameHandler for UdpEchoHandler {
    fn handle(&mut self, frame: &mut [u8]) -> Verdict {
        if frame.len() < ETH_HDR_LEN + IP_HDR_LEN + UDP_HDR_LEN {
            return Verdict::Release;
        }
        if u16::from_be_bytes([frame[12], frame[13]]) != 0x0800 {
            return Verdict::Release;
        }
        if frame[ETH_HDR_LEN + 9] != 17 {
            return Verdict::Release;
        }

        // Swapping both sides of each pair leaves the checksums valid.
        for i in 0..6 {
            frame.swap(i, 6 + i);
        }
        for i in 0..4 {
            frame.swap(ETH_HDR_LEN + 12 + i, ETH_HDR_LEN + 16 + i);
        }
        for i in 0..2 {
            frame.swap(ETH_HDR_LEN + IP_HDR_LEN + i, ETH_HDR_LEN + IP_HDR_LEN + 2 + i);
        }

        Verdict::Transmit(frame.len() as u32)
    }
}

/// Snapshot of the datapath counters at one instant.
#[derive(Debug, Clone, Copy)]
pub struct StatsRecord {
    pub timestamp: Instant,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Rates between two snapshots.
#[derive(Debug, Clone, Copy)]
pub struct StatsDelta {
    pub period_secs: f64,
    pub rx_pps: f64,
    pub rx_mbps: f64,
    pub tx_pps: f64,
    pub tx_mbps: f64,
}

impl StatsRecord {
    /// Rates since `prev`. A zero or negative period falls back to one
    /// second so a stalled clock never divides by zero.
    pub fn rates(&self, prev: &StatsRecord) -> StatsDelta {
        let mut period = self
            .timestamp
            .saturating_duration_since(prev.timestamp)
            .as_secs_f64();
        if period <= 0.0 {
            period = 1.0;
        }
        StatsDelta {
            period_secs: period,
            rx_pps: self.rx_packets.saturating_sub(prev.rx_packets) as f64 / period,
            rx_mbps: self.rx_bytes.saturating_sub(prev.rx_bytes) as f64 * 8.0
                / period
                / 1_000_000.0,
            tx_pps: self.tx_packets.saturating_sub(prev.tx_packets) as f64 / period,
            tx_mbps: self.tx_bytes.saturating_sub(prev.tx_bytes) as f64 * 8.0
                / period
                / 1_000_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn udp_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[0..6].copy_from_slice(&[2, 0, 0, 0, 0, 2]); // dst mac
        frame[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 1]); // src mac
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[14] = 0x45;
        frame[23] = 17;
        frame[26..30].copy_from_slice(&[10, 0, 0, 1]); // saddr
        frame[30..34].copy_from_slice(&[10, 0, 0, 2]); // daddr
        frame[34..36].copy_from_slice(&4000u16.to_be_bytes()); // sport
        frame[36..38].copy_from_slice(&5000u16.to_be_bytes()); // dport
        frame
    }

    #[test]
    fn test_echo_swaps_addressing() {
        let mut frame = udp_frame(64);
        let verdict = UdpEchoHandler.handle(&mut frame);
        assert_eq!(verdict, Verdict::Transmit(64));

        assert_eq!(&frame[0..6], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&frame[6..12], &[2, 0, 0, 0, 0, 2]);
        assert_eq!(&frame[26..30], &[10, 0, 0, 2]);
        assert_eq!(&frame[30..34], &[10, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([frame[34], frame[35]]), 5000);
        assert_eq!(u16::from_be_bytes([frame[36], frame[37]]), 4000);
    }

    #[test]
    fn test_echo_is_an_involution() {
        let original = udp_frame(96);
        let mut frame = original.clone();
        UdpEchoHandler.handle(&mut frame);
        UdpEchoHandler.handle(&mut frame);
        assert_eq!(frame, original);
    }

    #[test]
    fn test_echo_releases_non_udp() {
        let mut frame = udp_frame(64);
        frame[23] = 6; // TCP
        assert_eq!(UdpEchoHandler.handle(&mut frame), Verdict::Release);

        let mut short = vec![0u8; 20];
        assert_eq!(UdpEchoHandler.handle(&mut short), Verdict::Release);
    }

    #[test]
    fn test_stats_rates() {
        let t0 = Instant::now();
        let prev = StatsRecord {
            timestamp: t0,
            rx_packets: 1_000,
            rx_bytes: 1_000_000,
            tx_packets: 0,
            tx_bytes: 0,
        };
        let cur = StatsRecord {
            timestamp: t0 + Duration::from_secs(2),
            rx_packets: 3_000,
            rx_bytes: 3_000_000,
            tx_packets: 500,
            tx_bytes: 250_000,
        };

        let delta = cur.rates(&prev);
        assert!((delta.period_secs - 2.0).abs() < 1e-9);
        assert!((delta.rx_pps - 1_000.0).abs() < 1e-6);
        assert!((delta.rx_mbps - 8.0).abs() < 1e-6);
        assert!((delta.tx_pps - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_stats_zero_period_guard() {
        let t0 = Instant::now();
        let rec = StatsRecord {
            timestamp: t0,
            rx_packets: 100,
            rx_bytes: 100,
            tx_packets: 0,
            tx_bytes: 0,
        };
        let delta = rec.rates(&rec);
        assert_eq!(delta.period_secs, 1.0);
        assert_eq!(delta.rx_pps, 0.0);
    }
}

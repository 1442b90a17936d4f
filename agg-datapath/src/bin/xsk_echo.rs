//! Zero-copy datapath test: echo UDP traffic on an interface queue.
//!
//! Needs an XDP program on the interface redirecting into the socket map
//! (the aggregation daemon with the zero-copy flag, or any xsk redirect
//! program).
//!
//!   xsk_echo <interface> [queue] [seconds]

use std::time::{Duration, Instant};

use agg_datapath::{UdpEchoHandler, XskConfig, XskSocket};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let interface = std::env::args().nth(1).unwrap_or_else(|| "ens3".to_string());
    let queue_id: u32 = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "0".to_string())
        .parse()?;
    let seconds: u64 = std::env::args()
        .nth(3)
        .unwrap_or_else(|| "10".to_string())
        .parse()?;

    println!("=== AF_XDP Echo Test ===");
    println!("Interface: {} queue {}", interface, queue_id);
    println!("Duration: {}s", seconds);
    println!();

    let config = XskConfig {
        interface: interface.clone(),
        queue_id,
        ..XskConfig::default()
    };

    let mut socket = match XskSocket::bind(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to create AF_XDP socket: {}", e);
            eprintln!();
            eprintln!("This might be because:");
            eprintln!("  1. No XDP program is attached to the interface");
            eprintln!("  2. The interface doesn't support AF_XDP");
            eprintln!("  3. Running without root/CAP_NET_RAW");
            return Err(e);
        }
    };

    println!("Socket ready, {} frames free", socket.free_frames());
    println!();

    let mut handler = UdpEchoHandler;
    let start = Instant::now();
    let mut prev = socket.snapshot();
    let mut last_report = Instant::now();

    while start.elapsed() < Duration::from_secs(seconds) {
        let handled = socket.poll(&mut handler)?;

        if last_report.elapsed() >= Duration::from_secs(1) {
            let cur = socket.snapshot();
            let rates = cur.rates(&prev);
            println!(
                "[{:5.1}s] rx {:8.0} pps {:7.2} Mbit/s | tx {:8.0} pps {:7.2} Mbit/s | {} free frames",
                start.elapsed().as_secs_f64(),
                rates.rx_pps,
                rates.rx_mbps,
                rates.tx_pps,
                rates.tx_mbps,
                socket.free_frames(),
            );
            prev = cur;
            last_report = Instant::now();
        }

        if handled == 0 {
            // Nothing on the ring; don't starve the rest of the host.
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    let total = socket.snapshot();
    println!();
    println!("=== Final Results ===");
    println!("RX: {} packets, {} bytes", total.rx_packets, total.rx_bytes);
    println!("TX: {} packets, {} bytes", total.tx_packets, total.tx_bytes);
    println!("Duration: {:.2}s", start.elapsed().as_secs_f64());

    Ok(())
}

//! Round-trip smoke test: push one round of synthetic gradients through the
//! local hooks and wait for the aggregated result out of the pinned table.
//!
//! Run on a node whose daemon is attached:
//!   test_round <interface> <host-id> <round> [pin-dir]

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use agg_common::{AGG_PORT, FRAGMENT_SIZE, GRADIENT_SIZE};
use agg_node::poller::Poller;
use agg_node::sender::FragmentSender;
use agg_node::table::PinnedTable;
use rand::Rng;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let interface = std::env::args().nth(1).unwrap_or_else(|| "ens3".to_string());
    let host_id: u32 = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "0".to_string())
        .parse()?;
    let round: u32 = std::env::args()
        .nth(3)
        .unwrap_or_else(|| "0".to_string())
        .parse()?;
    let pin_dir = PathBuf::from(
        std::env::args()
            .nth(4)
            .unwrap_or_else(|| agg_node::DEFAULT_PIN_DIR.to_string()),
    );
    let sentinel = "198.18.0.254".parse()?;

    println!("=== Aggregation Round Test ===");
    println!("Interface: {}", interface);
    println!("Host id: {}  round: {}", host_id, round);
    println!(
        "Pushing {} fragments x {} lanes",
        FRAGMENT_SIZE, GRADIENT_SIZE
    );

    let mut rng = rand::thread_rng();
    let grads: Vec<i32> = (0..FRAGMENT_SIZE * GRADIENT_SIZE)
        .map(|_| rng.gen_range(-1000..1000))
        .collect();

    let sender = FragmentSender::bind(&interface, host_id, sentinel, AGG_PORT)?;
    let start = Instant::now();
    sender.send_round(round, &grads)?;
    println!("pushed in {:?}", start.elapsed());

    let table = PinnedTable::open(&pin_dir)?;
    let mut poller = Poller::new(table);
    let stop = AtomicBool::new(false);

    println!("waiting for round {} to finalize...", round);
    match poller.collect(round, &stop)? {
        Some(result) => {
            println!("collected {} lanes in {:?}", result.len(), start.elapsed());
            println!("fragment 0 head: {:?}", &result[..8]);
        }
        None => println!("interrupted"),
    }

    Ok(())
}

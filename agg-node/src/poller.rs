//! Host-side consumer of finalized rounds.
//!
//! Reads the shared table directly rather than the wire: a fragment is
//! taken once its slot has advanced past the pushed round with the ready
//! flag set, and the flag is cleared after the copy. That flag is the only
//! field this side ever writes while the hooks are live.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agg_common::GRADIENT_SIZE;
use anyhow::Result;

use crate::table::SlotStore;

/// Delay between table sweeps.
const SWEEP_PAUSE: Duration = Duration::from_micros(5);

pub struct Poller<S> {
    store: S,
}

impl<S: SlotStore> Poller<S> {
    pub fn new(store: S) -> Poller<S> {
        Poller { store }
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Block until every fragment has finalized for the round that was just
    /// pushed, and return the assembled gradient matrix
    /// (`fragments * GRADIENT_SIZE`, fragment-major).
    ///
    /// There is no timeout: a lost fragment stalls the round. `stop` is
    /// honored between sweeps and turns the call into `Ok(None)`.
    pub fn collect(&mut self, round: u32, stop: &AtomicBool) -> Result<Option<Vec<i32>>> {
        let fragments = self.store.len() as usize;
        let mut grads = vec![0i32; fragments * GRADIENT_SIZE];
        let mut observed = vec![false; fragments];
        let mut remaining = fragments;

        while remaining > 0 {
            if stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            for fragment_id in 0..fragments {
                if observed[fragment_id] {
                    continue;
                }
                let mut slot = self.store.read(fragment_id as u32)?;
                if slot.busy != 0 {
                    continue;
                }
                if slot.ready == 0 || slot.round != round.wrapping_add(1) {
                    continue;
                }

                let base = fragment_id * GRADIENT_SIZE;
                grads[base..base + GRADIENT_SIZE].copy_from_slice(&slot.agg);
                slot.ready = 0;
                self.store.write(fragment_id as u32, &slot)?;
                observed[fragment_id] = true;
                remaining -= 1;
            }
            if remaining > 0 {
                std::thread::sleep(SWEEP_PAUSE);
            }
        }
        Ok(Some(grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agg_common::FragmentSlot;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedTable(Arc<Mutex<Vec<FragmentSlot>>>);

    impl SharedTable {
        fn new(fragments: usize) -> SharedTable {
            SharedTable(Arc::new(Mutex::new(vec![FragmentSlot::ZERO; fragments])))
        }
    }

    impl SlotStore for SharedTable {
        fn len(&self) -> u32 {
            self.0.lock().unwrap().len() as u32
        }

        fn read(&self, fragment_id: u32) -> Result<FragmentSlot> {
            Ok(self.0.lock().unwrap()[fragment_id as usize])
        }

        fn write(&mut self, fragment_id: u32, slot: &FragmentSlot) -> Result<()> {
            self.0.lock().unwrap()[fragment_id as usize] = *slot;
            Ok(())
        }
    }

    fn finalize(slot: &mut FragmentSlot, round: u32, value: i32) {
        slot.round = round + 1;
        slot.ready = 1;
        slot.agg = [value; GRADIENT_SIZE];
    }

    #[test]
    fn test_collect_assembles_matrix_and_clears_ready() {
        let table = SharedTable::new(4);
        {
            let mut slots = table.0.lock().unwrap();
            for (i, slot) in slots.iter_mut().enumerate() {
                finalize(slot, 0, i as i32 + 1);
            }
        }

        let stop = AtomicBool::new(false);
        let mut poller = Poller::new(table.clone());
        let grads = poller.collect(0, &stop).unwrap().unwrap();

        assert_eq!(grads.len(), 4 * GRADIENT_SIZE);
        assert_eq!(grads[0], 1);
        assert_eq!(grads[GRADIENT_SIZE], 2);
        assert_eq!(grads[3 * GRADIENT_SIZE + 5], 4);

        let slots = table.0.lock().unwrap();
        assert!(slots.iter().all(|slot| slot.ready == 0));
        assert!(slots.iter().all(|slot| slot.round == 1));
    }

    #[test]
    fn test_collect_waits_for_late_fragment() {
        let table = SharedTable::new(3);
        {
            let mut slots = table.0.lock().unwrap();
            finalize(&mut slots[0], 0, 10);
            finalize(&mut slots[2], 0, 30);
        }

        let mut late = table.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut slot = late.read(1).unwrap();
            finalize(&mut slot, 0, 20);
            late.write(1, &slot).unwrap();
        });

        let stop = AtomicBool::new(false);
        let mut poller = Poller::new(table);
        let grads = poller.collect(0, &stop).unwrap().unwrap();
        writer.join().unwrap();

        assert_eq!(grads[GRADIENT_SIZE], 20);
    }

    #[test]
    fn test_stop_flag_interrupts() {
        // One fragment never finalizes; the stop flag is the only way out.
        let table = SharedTable::new(2);
        {
            let mut slots = table.0.lock().unwrap();
            finalize(&mut slots[0], 0, 1);
        }

        let stop = AtomicBool::new(true);
        let mut poller = Poller::new(table);
        assert_eq!(poller.collect(0, &stop).unwrap(), None);
    }

    #[test]
    fn test_wrong_round_not_taken() {
        let table = SharedTable::new(1);
        {
            let mut slots = table.0.lock().unwrap();
            // Ready, but for a later round than the one being collected.
            finalize(&mut slots[0], 5, 99);
        }

        let stop = AtomicBool::new(true);
        let mut poller = Poller::new(table.clone());
        assert_eq!(poller.collect(0, &stop).unwrap(), None);
        // The mismatched slot was left untouched.
        assert_eq!(table.0.lock().unwrap()[0].ready, 1);
    }

    #[test]
    fn test_busy_slot_skipped() {
        let table = SharedTable::new(1);
        {
            let mut slots = table.0.lock().unwrap();
            finalize(&mut slots[0], 0, 7);
            slots[0].busy = 1;
        }

        let stop = AtomicBool::new(true);
        let mut poller = Poller::new(table.clone());
        assert_eq!(poller.collect(0, &stop).unwrap(), None);
        assert_eq!(table.0.lock().unwrap()[0].ready, 1);
    }
}

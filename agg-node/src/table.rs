//! The shared fragment table as an owned, bounded store.

use std::path::Path;

use agg_common::{FragmentSlot, FRAGMENT_SIZE, TABLE_PIN_NAME};
use anyhow::{Context, Result};
use aya::maps::{Array, Map, MapData};

/// Read/write access to the per-fragment slots, independent of where they
/// live. The kernel-owned pinned map is the production implementation;
/// tests run against an in-memory table.
pub trait SlotStore {
    fn len(&self) -> u32;
    fn read(&self, fragment_id: u32) -> Result<FragmentSlot>;
    fn write(&mut self, fragment_id: u32, slot: &FragmentSlot) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The aggregation table pinned by the loader, opened by path from any
/// process on the host.
pub struct PinnedTable {
    map: Array<MapData, FragmentSlot>,
}

impl PinnedTable {
    pub fn open(pin_dir: &Path) -> Result<PinnedTable> {
        let path = pin_dir.join(TABLE_PIN_NAME);
        let data = MapData::from_pin(&path)
            .with_context(|| format!("opening pinned table {}", path.display()))?;
        let map = Array::try_from(Map::Array(data))
            .context("pinned object is not an array map")?;
        Ok(PinnedTable { map })
    }

    /// Reset every slot to round zero.
    pub fn clear(&mut self) -> Result<()> {
        for fragment_id in 0..self.len() {
            self.write(fragment_id, &FragmentSlot::ZERO)?;
        }
        Ok(())
    }
}

impl SlotStore for PinnedTable {
    fn len(&self) -> u32 {
        FRAGMENT_SIZE as u32
    }

    fn read(&self, fragment_id: u32) -> Result<FragmentSlot> {
        Ok(self.map.get(&fragment_id, 0)?)
    }

    fn write(&mut self, fragment_id: u32, slot: &FragmentSlot) -> Result<()> {
        self.map.set(fragment_id, *slot, 0)?;
        Ok(())
    }
}

use crate::error::Error;
use core::sync::atomic::{AtomicU64, Ordering};

const ADDR_BITS: u32 = 63;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
const FLAG_BIT: u64 = 1 << ADDR_BITS;

/// One mapping slot: 63 bits of physical address, 1 flag bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapEntry(u64);

impl MapEntry {
    pub fn pack(addr: u64, flag: bool) -> MapEntry {
        debug_assert!(addr <= ADDR_MASK);
        MapEntry((addr & ADDR_MASK) | if flag { FLAG_BIT } else { 0 })
    }

    pub fn addr(&self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn flag(&self) -> bool {
        self.0 & FLAG_BIT != 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The logical-id to physical-address table.
///
/// A flat array of atomics indexed by id, sized once at init. Upserts swap
/// the slot so the returned value is the exact predecessor of the new one;
/// no per-row lock exists or is needed. Volatile by design, like the zone
/// metadata; `flush` is a placeholder for a recovery extension.
pub struct Map {
    tbl: Vec<AtomicU64>,
}

impl Map {
    pub fn new(entries: u64) -> Map {
        let mut tbl = Vec::with_capacity(entries as usize);
        tbl.resize_with(entries as usize, || AtomicU64::new(0));
        Map { tbl }
    }

    pub fn entries(&self) -> u64 {
        self.tbl.len() as u64
    }

    /// Replace the entry at `id`, returning the previous address.
    pub fn upsert(&self, id: u64, addr: u64, flag: bool) -> Result<u64, Error> {
        let slot = self
            .tbl
            .get(id as usize)
            .ok_or(Error::MapOutOfRange(id, self.entries()))?;
        if addr > ADDR_MASK {
            return Err(Error::MapOutOfRange(id, self.entries()));
        }
        let old = slot.swap(MapEntry::pack(addr, flag).raw(), Ordering::AcqRel);
        Ok(MapEntry(old).addr())
    }

    /// The stored address for `id`; 0 when unset.
    pub fn read(&self, id: u64) -> Result<u64, Error> {
        let slot = self
            .tbl
            .get(id as usize)
            .ok_or(Error::MapOutOfRange(id, self.entries()))?;
        Ok(MapEntry(slot.load(Ordering::Acquire)).addr())
    }

    /// The stored entry with its flag bit.
    pub fn read_entry(&self, id: u64) -> Result<MapEntry, Error> {
        let slot = self
            .tbl
            .get(id as usize)
            .ok_or(Error::MapOutOfRange(id, self.entries()))?;
        Ok(MapEntry(slot.load(Ordering::Acquire)))
    }

    /// Persistence hooks; the in-memory table has nothing to write back.
    pub fn mark(&self, _id: u64) {}

    pub fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn upsert_returns_exact_predecessor() {
        let map = Map::new(16);
        assert_eq!(map.upsert(3, 100, false).unwrap(), 0);
        assert_eq!(map.upsert(3, 200, false).unwrap(), 100);
        assert_eq!(map.read(3).unwrap(), 200);
        assert_eq!(map.read(4).unwrap(), 0);
    }

    #[test]
    fn flag_bit_is_kept_apart_from_the_address() {
        let map = Map::new(4);
        map.upsert(1, 0x7FFF_FFFF, true).unwrap();
        assert_eq!(map.read(1).unwrap(), 0x7FFF_FFFF);
        assert!(map.read_entry(1).unwrap().flag());
        map.upsert(1, 5, false).unwrap();
        assert!(!map.read_entry(1).unwrap().flag());
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let map = Map::new(8);
        assert!(matches!(map.upsert(8, 1, false), Err(Error::MapOutOfRange(8, 8))));
        assert!(map.read(9).is_err());
        assert!(map.upsert(0, 1 << 63, false).is_err());
    }

    #[test]
    fn concurrent_upserts_hand_back_every_value_once() {
        // Each swap returns the exact predecessor, so across all threads the
        // set of returned values plus the final value must be exactly the
        // set of written values plus the initial zero.
        let map = Arc::new(Map::new(1));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let map = map.clone();
            handles.push(thread::spawn(move || {
                let mut olds = Vec::new();
                for i in 0..1000u64 {
                    let val = t * 1000 + i + 1;
                    olds.push(map.upsert(0, val, false).unwrap());
                }
                olds
            }));
        }
        let mut seen: Vec<u64> = Vec::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }
        seen.push(map.read(0).unwrap());
        seen.sort_unstable();
        let mut expected: Vec<u64> = (0..=4000).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}

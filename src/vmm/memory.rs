use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use vm_memory::{Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use crate::error::{Error, Result};

pub const PAGE_SIZE: u64 = 0x1000;

/// Host-backed guest-physical memory mapped under one KVM slot.
///
/// The backing is a private anonymous mapping, so it starts zeroed. KVM maps
/// the same host pages, so writes made here are what the guest sees on its
/// next fetch.
#[derive(Debug)]
pub struct MemoryRegion {
    slot: u32,
    guest_base: GuestAddress,
    size: u64,
    mem: GuestMemoryMmap,
}

impl MemoryRegion {
    pub fn new(slot: u32, guest_base: GuestAddress, size: u64) -> Result<Self> {
        validate(slot, guest_base.0, size)?;
        let len: usize = size.try_into().map_err(|_| Error::Allocation {
            size,
            reason: "size does not fit the host address space".to_string(),
        })?;
        let mem: GuestMemoryMmap = GuestMemoryMmap::from_ranges(&[(guest_base, len)])
            .map_err(|e| Error::Allocation { size, reason: e.to_string() })?;
        debug!("allocated {:#x} bytes for slot {} at {:#x}", size, slot, guest_base.0);
        Ok(Self { slot, guest_base, size, mem })
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn guest_base(&self) -> GuestAddress {
        self.guest_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.guest_base.0 + self.size
    }

    pub fn contains(&self, addr: GuestAddress) -> bool {
        addr.0 >= self.guest_base.0 && addr.0 < self.end()
    }

    /// Userspace address handed to KVM.
    pub fn host_address(&self) -> Result<u64> {
        self.mem
            .get_host_address(self.guest_base)
            .map(|p| p as u64)
            .map_err(|_| Error::UnmappedAddress(self.guest_base.0))
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let addr = self.checked(offset, bytes.len())?;
        self.mem.write_slice(bytes, addr).map_err(|_| self.out_of_bounds(offset, bytes.len()))
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let addr = self.checked(offset, len)?;
        let mut buf = vec![0u8; len];
        self.mem.read_slice(&mut buf, addr).map_err(|_| self.out_of_bounds(offset, len))?;
        Ok(buf)
    }

    fn checked(&self, offset: u64, len: usize) -> Result<GuestAddress> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(GuestAddress(self.guest_base.0 + offset)),
            _ => Err(self.out_of_bounds(offset, len)),
        }
    }

    fn out_of_bounds(&self, offset: u64, len: usize) -> Error {
        Error::OutOfBounds { offset, len, size: self.size }
    }
}

fn validate(slot: u32, guest_base: u64, size: u64) -> Result<()> {
    let invalid = |reason| Err(Error::InvalidRegion { slot, guest_base, size, reason });
    if size == 0 {
        return invalid("size is zero");
    }
    if size % PAGE_SIZE != 0 {
        return invalid("size is not page aligned");
    }
    if guest_base % PAGE_SIZE != 0 {
        return invalid("base is not page aligned");
    }
    if guest_base.checked_add(size).is_none() {
        return invalid("range wraps the address space");
    }
    Ok(())
}

/// Slot-keyed bookkeeping of a VM's regions.
#[derive(Debug, Default)]
pub struct RegionRegistry {
    regions: BTreeMap<u32, Arc<MemoryRegion>>,
}

impl RegionRegistry {
    /// Fails if `slot` is taken or `[guest_base, guest_base + size)` hits another region.
    pub fn check(&self, slot: u32, guest_base: u64, size: u64) -> Result<()> {
        if self.regions.contains_key(&slot) {
            return Err(Error::SlotInUse(slot));
        }
        let end = guest_base.saturating_add(size);
        if let Some(existing) = self
            .regions
            .values()
            .find(|r| guest_base < r.end() && r.guest_base().0 < end)
        {
            return Err(Error::RangeOverlap { guest_base, end, existing: existing.slot() });
        }
        Ok(())
    }

    pub fn insert(&mut self, region: Arc<MemoryRegion>) -> Result<()> {
        self.check(region.slot(), region.guest_base().0, region.size())?;
        self.regions.insert(region.slot(), region);
        Ok(())
    }

    pub fn get(&self, slot: u32) -> Option<&Arc<MemoryRegion>> {
        self.regions.get(&slot)
    }

    pub fn find(&self, addr: GuestAddress) -> Option<&Arc<MemoryRegion>> {
        self.regions.values().find(|r| r.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MemoryRegion>> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn region(slot: u32, base: u64, size: u64) -> Arc<MemoryRegion> {
        Arc::new(MemoryRegion::new(slot, GuestAddress(base), size).unwrap())
    }

    #[test]
    fn fresh_region_is_zeroed() {
        let r = region(0, 0x1000, 0x2000);
        assert!(r.read(0, 0x2000).unwrap().iter().all(|&b| b == 0));
        assert_ne!(r.host_address().unwrap(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let r = region(0, 0x10000, 0x4000);
        for offset in [0u64, 1, 0xfff, 0x1000, 0x3ff0] {
            let data: Vec<u8> = (0..16).map(|i| (offset as u8).wrapping_add(i)).collect();
            r.write(offset, &data).unwrap();
            assert_eq!(r.read(offset, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn access_past_the_end_is_rejected() {
        let r = region(0, 0x1000, 0x1000);
        assert!(matches!(r.write(0xffc, &[0; 8]), Err(Error::OutOfBounds { .. })));
        assert!(matches!(r.read(0x1000, 1), Err(Error::OutOfBounds { .. })));
        assert!(matches!(r.read(u64::MAX, 2), Err(Error::OutOfBounds { .. })));
        r.write(0xff8, &[1; 8]).unwrap();
    }

    #[test]
    fn geometry_is_validated() {
        for (base, size) in [(0x1000, 0), (0x1000, 0x800), (0x1800, 0x1000), (u64::MAX & !0xfff, 0x2000)] {
            let err = MemoryRegion::new(0, GuestAddress(base), size).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "base {base:#x} size {size:#x}");
        }
    }

    #[test]
    fn duplicate_slot_conflicts() {
        let mut reg = RegionRegistry::default();
        reg.insert(region(0, 0x1000, 0x1000)).unwrap();
        let err = reg.insert(region(0, 0x8000, 0x1000)).unwrap_err();
        assert!(matches!(err, Error::SlotInUse(0)));
        assert_eq!(err.kind(), ErrorKind::RegionConflict);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn overlapping_ranges_conflict() {
        let mut reg = RegionRegistry::default();
        reg.insert(region(0, 0x2000, 0x2000)).unwrap();
        for (base, size) in [(0x2000, 0x1000), (0x1000, 0x2000), (0x3000, 0x4000), (0x0, 0x10000)] {
            let err = reg.check(1, base, size).unwrap_err();
            assert!(matches!(err, Error::RangeOverlap { existing: 0, .. }), "base {base:#x}");
        }
    }

    #[test]
    fn adjacent_ranges_do_not_conflict() {
        let mut reg = RegionRegistry::default();
        reg.insert(region(0, 0x2000, 0x2000)).unwrap();
        reg.insert(region(1, 0x1000, 0x1000)).unwrap();
        reg.insert(region(2, 0x4000, 0x1000)).unwrap();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.find(GuestAddress(0x4fff)).map(|r| r.slot()), Some(2));
        assert_eq!(reg.find(GuestAddress(0x1000)).map(|r| r.slot()), Some(1));
        assert!(reg.find(GuestAddress(0x5000)).is_none());
        assert_eq!(reg.get(0).map(|r| r.size()), Some(0x2000));
    }
}

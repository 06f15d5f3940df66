use std::sync::{Arc, PoisonError, RwLock};

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use log::info;
use vm_memory::GuestAddress;

use super::memory::{MemoryRegion, RegionRegistry};
use super::vcpu::Vcpu;
use crate::error::{Error, Resource, Result};

/// A guest address space plus the vCPUs that execute in it.
pub struct Vm {
    // Dropped in declaration order: vCPUs, then the VM fd, then the memory
    // that was mapped into it.
    vcpus: Vec<Vcpu>,
    fd: VmFd,
    regions: Arc<RwLock<RegionRegistry>>,
    index: usize,
}

impl Vm {
    pub(crate) fn new(fd: VmFd, index: usize) -> Self {
        Self { vcpus: Vec::new(), fd, regions: Arc::default(), index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Allocates `size` zeroed bytes and maps them at `guest_base` under `slot`.
    ///
    /// The registry stays write-locked across the KVM registration so two
    /// attachments cannot both pass the conflict check.
    pub fn attach_memory(&self, slot: u32, guest_base: GuestAddress, size: u64) -> Result<Arc<MemoryRegion>> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        regions.check(slot, guest_base.0, size)?;

        let region = Arc::new(MemoryRegion::new(slot, guest_base, size)?);
        let mem_region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_base.0,
            memory_size: size,
            userspace_addr: region.host_address()?,
        };
        // SAFETY: the mapping is owned by `region`, which the registry keeps
        // alive until after the VM fd is closed.
        unsafe { self.fd.set_user_memory_region(mem_region) }
            .map_err(|source| Error::RegisterMemory { slot, source })?;

        regions.insert(Arc::clone(&region))?;
        info!(
            "vm {}: slot {} mapped at {:#x} ({:#x} bytes)",
            self.index, slot, guest_base.0, size
        );
        Ok(region)
    }

    pub fn region(&self, slot: u32) -> Option<Arc<MemoryRegion>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner).get(slot).cloned()
    }

    pub fn region_containing(&self, addr: GuestAddress) -> Option<Arc<MemoryRegion>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner).find(addr).cloned()
    }

    pub fn regions(&self) -> Vec<Arc<MemoryRegion>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub fn create_vcpu(&mut self, id: u64) -> Result<&mut Vcpu> {
        let fd = self
            .fd
            .create_vcpu(id)
            .map_err(|source| Error::Create { resource: Resource::Vcpu, source })?;
        info!("vm {}: vcpu {} created", self.index, id);
        let at = self.vcpus.len();
        self.vcpus.push(Vcpu::new(id, fd, Arc::clone(&self.regions)));
        Ok(&mut self.vcpus[at])
    }

    pub fn vcpu_mut(&mut self, id: u64) -> Option<&mut Vcpu> {
        self.vcpus.iter_mut().find(|v| v.id() == id)
    }

    /// All vCPUs, e.g. to hand one to each thread of a scoped pool.
    pub fn vcpus_mut(&mut self) -> &mut [Vcpu] {
        &mut self.vcpus
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        info!("vm {}: released ({} vcpus, {} regions)", self.index, self.vcpus.len(), self.regions().len());
    }
}

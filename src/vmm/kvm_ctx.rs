use kvm_ioctls::{Cap, Kvm};
use log::{debug, info};

use super::vm::Vm;
use crate::error::{Error, Resource, Result};

const KVM_API_VERSION: i32 = 12;

/// Process-wide handle on /dev/kvm. Owns every VM created through it.
pub struct Hypervisor {
    // VMs go before the KVM fd.
    vms: Vec<Vm>,
    kvm: Option<Kvm>,
    vcpu_mmap_size: usize,
    next_index: usize,
}

impl Hypervisor {
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::OpenFacility)?;
        let version = kvm.get_api_version();
        if version != KVM_API_VERSION {
            return Err(Error::UnsupportedApi(version));
        }
        if !kvm.check_extension(Cap::UserMemory) {
            return Err(Error::MissingCapability("KVM_CAP_USER_MEMORY"));
        }
        let vcpu_mmap_size = kvm.get_vcpu_mmap_size().map_err(Error::OpenFacility)?;
        info!("KVM initialized (api {}, vcpu run area {} bytes)", version, vcpu_mmap_size);
        Ok(Self { vms: Vec::new(), kvm: Some(kvm), vcpu_mmap_size, next_index: 0 })
    }

    pub fn vcpu_mmap_size(&self) -> usize {
        self.vcpu_mmap_size
    }

    pub fn create_vm(&mut self) -> Result<&mut Vm> {
        let kvm = self.kvm.as_ref().ok_or(Error::Released)?;
        let fd = kvm
            .create_vm()
            .map_err(|source| Error::Create { resource: Resource::Vm, source })?;
        let index = self.next_index;
        self.next_index += 1;
        info!("vm {} created", index);
        let at = self.vms.len();
        self.vms.push(Vm::new(fd, index));
        Ok(&mut self.vms[at])
    }

    /// Looks a VM up by the index it was created with.
    pub fn vm_mut(&mut self, index: usize) -> Option<&mut Vm> {
        self.vms.iter_mut().find(|vm| vm.index() == index)
    }

    /// Tears down one VM (vCPUs, fd, then memory) while the handle stays open.
    /// Indices are never reused. Returns false if no live VM has `index`.
    pub fn destroy_vm(&mut self, index: usize) -> bool {
        match self.vms.iter().position(|vm| vm.index() == index) {
            Some(at) => {
                drop(self.vms.remove(at));
                true
            }
            None => {
                debug!("no live vm {}", index);
                false
            }
        }
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    pub fn is_released(&self) -> bool {
        self.kvm.is_none()
    }

    /// Tears down every VM (and with them their vCPUs and memory), then closes
    /// /dev/kvm. Returns how many VMs were torn down; later calls return 0.
    pub fn release(&mut self) -> usize {
        let Some(kvm) = self.kvm.take() else {
            debug!("hypervisor already released");
            return 0;
        };
        let vms = std::mem::take(&mut self.vms);
        let count = vms.len();
        drop(vms);
        drop(kvm);
        info!("KVM released ({} vms)", count);
        count
    }
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        self.release();
    }
}

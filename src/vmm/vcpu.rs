use std::sync::{Arc, PoisonError, RwLock};

use kvm_bindings::{kvm_regs, kvm_run, kvm_sregs, KVM_EXIT_INTERNAL_ERROR};
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, trace};
use vm_memory::GuestAddress;

use super::exit::{ExitEvent, ExitSource, IoAccess, IoDirection, MmioAccess};
use super::memory::RegionRegistry;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum PendingRead {
    Io,
    Mmio,
}

/// One virtual CPU of a [`Vm`](super::vm::Vm).
///
/// Holds a handle on the VM's region registry so the memory it executes from
/// stays mapped for as long as the vCPU exists.
pub struct Vcpu {
    id: u64,
    fd: VcpuFd,
    regions: Arc<RwLock<RegionRegistry>>,
    pending: Option<PendingRead>,
    entry_checked: bool,
    steps: u64,
}

impl Vcpu {
    pub(crate) fn new(id: u64, fd: VcpuFd, regions: Arc<RwLock<RegionRegistry>>) -> Self {
        Self { id, fd, regions, pending: None, entry_checked: false, steps: 0 }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of `step()` calls made so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn registers(&self) -> Result<kvm_regs> {
        self.fd
            .get_regs()
            .map_err(|source| Error::GetRegisters { what: "general registers", source })
    }

    pub fn set_registers(&mut self, regs: &kvm_regs) -> Result<()> {
        self.fd
            .set_regs(regs)
            .map_err(|source| Error::SetRegisters { what: "general registers", source })?;
        self.entry_checked = false;
        Ok(())
    }

    pub fn segment_registers(&self) -> Result<kvm_sregs> {
        self.fd
            .get_sregs()
            .map_err(|source| Error::GetRegisters { what: "segment registers", source })
    }

    pub fn set_segment_registers(&mut self, sregs: &kvm_sregs) -> Result<()> {
        self.fd
            .set_sregs(sregs)
            .map_err(|source| Error::SetRegisters { what: "segment registers", source })?;
        self.entry_checked = false;
        Ok(())
    }

    /// Overrides only base and selector of CS, keeping KVM's defaults for the rest.
    pub fn set_code_segment(&mut self, base: u64, selector: u16) -> Result<()> {
        let mut sregs = self.segment_registers()?;
        sregs.cs.base = base;
        sregs.cs.selector = selector;
        self.set_segment_registers(&sregs)
    }

    /// Runs the guest until it exits back to the host. Blocks for as long as
    /// the guest runs.
    pub fn step(&mut self) -> Result<ExitEvent> {
        if !self.entry_checked {
            self.check_entry()?;
            self.entry_checked = true;
        }
        self.pending = None;
        self.steps += 1;

        let mut event = match self.fd.run() {
            Ok(exit) => decode(exit),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => ExitEvent::Interrupted,
            Err(source) => return Err(Error::Run { vcpu: self.id, source }),
        };
        self.fill_from_run(&mut event);
        trace!("vcpu {} step {}: {:?}", self.id, self.steps, event);
        Ok(event)
    }

    /// Writes the data for a pending port-in or MMIO read into the run
    /// structure; KVM hands it to the guest on the next step.
    pub fn complete_read(&mut self, data: &[u8]) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            debug!("vcpu {}: no read pending, dropping {} bytes", self.id, data.len());
            return Ok(());
        };
        let run = self.fd.get_kvm_run();
        match pending {
            PendingRead::Io => {
                // SAFETY: the last exit was KVM_EXIT_IO, so `io` is the active member.
                let io = unsafe { run.__bindgen_anon_1.io };
                let len = (usize::from(io.size) * io.count as usize).min(data.len());
                let base = run as *mut kvm_run as *mut u8;
                // SAFETY: KVM places data_offset + size * count inside the vcpu mapping.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(io.data_offset as usize), len);
                }
            }
            PendingRead::Mmio => {
                // SAFETY: the last exit was KVM_EXIT_MMIO, so `mmio` is the active member.
                let mmio = unsafe { &mut run.__bindgen_anon_1.mmio };
                let len = (mmio.len as usize).min(mmio.data.len()).min(data.len());
                mmio.data[..len].copy_from_slice(&data[..len]);
            }
        }
        Ok(())
    }

    fn check_entry(&self) -> Result<()> {
        let regs = self.registers()?;
        let sregs = self.segment_registers()?;
        let entry = sregs.cs.base.wrapping_add(regs.rip);
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        if regions.find(GuestAddress(entry)).is_none() {
            return Err(Error::UnmappedAddress(entry));
        }
        Ok(())
    }

    /// Completes the fields `VcpuExit` does not carry.
    fn fill_from_run(&mut self, event: &mut ExitEvent) {
        let run = self.fd.get_kvm_run();
        match event {
            ExitEvent::IoPort(io) => {
                // SAFETY: decoded from KVM_EXIT_IO.
                let raw = unsafe { run.__bindgen_anon_1.io };
                io.width = raw.size;
                io.count = raw.count;
                if io.direction == IoDirection::In {
                    self.pending = Some(PendingRead::Io);
                }
            }
            ExitEvent::MemoryMappedAccess(mmio) if !mmio.is_write => {
                self.pending = Some(PendingRead::Mmio);
            }
            ExitEvent::Error(code) if run.exit_reason == KVM_EXIT_INTERNAL_ERROR => {
                // SAFETY: exit_reason selects `internal`.
                *code = u64::from(unsafe { run.__bindgen_anon_1.internal.suberror });
            }
            ExitEvent::Unrecognized(reason) => *reason = run.exit_reason,
            _ => {}
        }
    }
}

fn decode(exit: VcpuExit<'_>) -> ExitEvent {
    match exit {
        VcpuExit::Hlt => ExitEvent::Halted,
        VcpuExit::Unknown => ExitEvent::Unknown,
        VcpuExit::Shutdown => ExitEvent::Shutdown,
        VcpuExit::Intr => ExitEvent::Interrupted,
        VcpuExit::IoOut(port, data) => ExitEvent::IoPort(IoAccess {
            direction: IoDirection::Out,
            port,
            width: 0,
            count: 0,
            data: data.to_vec(),
        }),
        VcpuExit::IoIn(port, data) => ExitEvent::IoPort(IoAccess {
            direction: IoDirection::In,
            port,
            width: 0,
            count: 0,
            data: vec![0; data.len()],
        }),
        VcpuExit::MmioWrite(address, data) => ExitEvent::MemoryMappedAccess(MmioAccess {
            address,
            is_write: true,
            data: data.to_vec(),
        }),
        VcpuExit::MmioRead(address, data) => ExitEvent::MemoryMappedAccess(MmioAccess {
            address,
            is_write: false,
            data: vec![0; data.len()],
        }),
        VcpuExit::FailEntry(reason, _cpu) => ExitEvent::Error(reason),
        VcpuExit::InternalError => ExitEvent::Error(0),
        other => {
            debug!("undecoded exit {:?}", other);
            ExitEvent::Unrecognized(0)
        }
    }
}

impl ExitSource for Vcpu {
    fn step(&mut self) -> Result<ExitEvent> {
        Vcpu::step(self)
    }

    fn complete_read(&mut self, data: &[u8]) -> Result<()> {
        Vcpu::complete_read(self, data)
    }
}

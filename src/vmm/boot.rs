use kvm_bindings::kvm_regs;
use log::info;
use vm_memory::GuestAddress;

use super::vcpu::Vcpu;
use super::vm::Vm;
use crate::config::RegisterConfig;
use crate::error::{Error, Result};

/// Real-mode demo: prints `al + bl` as a digit and a newline on COM1, then halts.
pub const DEMO_IMAGE: [u8; 12] = [
    0xba, 0xf8, 0x03, // mov $0x3f8, %dx
    0x00, 0xd8, // add %bl, %al
    0x04, b'0', // add $'0', %al
    0xee, // out %al, (%dx)
    0xb0, b'\n', // mov $'\n', %al
    0xee, // out %al, (%dx)
    0xf4, // hlt
];

pub const DEMO_LOAD_ADDRESS: u64 = 0x1000;

// Highest linear address a real-mode CS:IP can reach without wrapping.
const REAL_MODE_LIMIT: u64 = 0x10_0000;

/// Raw guest code placed at a fixed guest-physical address.
pub struct GuestImage<'a> {
    pub bytes: &'a [u8],
    pub load_address: GuestAddress,
}

impl<'a> GuestImage<'a> {
    pub fn new(bytes: &'a [u8], load_address: GuestAddress) -> Self {
        Self { bytes, load_address }
    }

    /// Copies the image into whichever region of `vm` contains the load address.
    pub fn load(&self, vm: &Vm) -> Result<()> {
        let region = vm
            .region_containing(self.load_address)
            .ok_or(Error::UnmappedAddress(self.load_address.0))?;
        region.write(self.load_address.0 - region.guest_base().0, self.bytes)?;
        info!("loaded {} bytes at {:#x}", self.bytes.len(), self.load_address.0);
        Ok(())
    }
}

/// Splits a linear entry address into the CS base/selector and IP of a flat
/// real-mode start.
pub fn real_mode_entry(entry: GuestAddress) -> Result<(u64, u16, u64)> {
    if entry.0 >= REAL_MODE_LIMIT {
        return Err(Error::EntryOutOfRange(entry.0));
    }
    let base = entry.0 & !0xffff;
    Ok((base, (base >> 4) as u16, entry.0 & 0xffff))
}

/// Puts `vcpu` in real mode at `entry` with the given general registers.
/// Everything not in `regs` starts zeroed; the remaining segment state keeps
/// KVM's reset defaults.
pub fn setup_real_mode(vcpu: &mut Vcpu, entry: GuestAddress, regs: &RegisterConfig) -> Result<()> {
    let (cs_base, cs_selector, ip) = real_mode_entry(entry)?;
    let kregs = kvm_regs {
        rip: ip,
        rax: regs.rax,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rsi: regs.rsi,
        rdi: regs.rdi,
        rsp: regs.rsp,
        rbp: regs.rbp,
        rflags: regs.rflags,
        ..Default::default()
    };
    vcpu.set_registers(&kregs)?;
    vcpu.set_code_segment(cs_base, cs_selector)?;
    info!(
        "vcpu {}: real mode at {:04x}:{:04x} (rax={:#x}, rbx={:#x})",
        vcpu.id(),
        cs_selector,
        ip,
        regs.rax,
        regs.rbx
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_entries_use_a_zero_code_segment() {
        assert_eq!(real_mode_entry(GuestAddress(0x1000)).unwrap(), (0, 0, 0x1000));
        assert_eq!(real_mode_entry(GuestAddress(0xffff)).unwrap(), (0, 0, 0xffff));
    }

    #[test]
    fn high_entries_move_the_segment() {
        assert_eq!(real_mode_entry(GuestAddress(0x7_1234)).unwrap(), (0x7_0000, 0x7000, 0x1234));
        assert!(matches!(
            real_mode_entry(GuestAddress(0x10_0000)),
            Err(Error::EntryOutOfRange(0x10_0000))
        ));
    }

    #[test]
    fn demo_image_ends_in_hlt() {
        assert_eq!(DEMO_IMAGE.last(), Some(&0xf4));
        assert_eq!(DEMO_IMAGE.iter().filter(|&&b| b == 0xee).count(), 2);
    }
}

use std::io::Write;
use std::time::Duration;

use vm_memory::GuestAddress;

use super::boot::{self, GuestImage};
use super::devices::{SerialConsole, SharedBuffer, UART_PORTS};
use super::event_loop::{ExitDispatcher, PortMatch, RunReport};
use super::kvm_ctx::Hypervisor;
use super::watchdog;
use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::types::RunResult;


/// Runs `code` to completion and returns what it printed on the serial port.
pub fn run_guest(code: &[u8], config: &VmConfig) -> Result<RunResult> {
    let console = SharedBuffer::default();
    let report = run_with_console(code, config, console.clone())?;
    Ok(RunResult::new(report, console.to_string_lossy()))
}


/// Same as [`run_guest`] but streams the serial output to `out`.
pub fn run_with_console<W: Write + Send + 'static>(code: &[u8], config: &VmConfig, out: W) -> Result<RunReport> {
    // 1) KVM + VM
    let mut hv = Hypervisor::open()?;
    let vm = hv.create_vm()?;

    // 2) memory
    for r in &config.memory {
        vm.attach_memory(r.slot, GuestAddress(r.guest_base), r.size)?;
    }

    // 3) guest code
    GuestImage::new(code, GuestAddress(config.load_address)).load(vm)?;

    // 4) vCPU in real mode at the entry point
    let vcpu = vm.create_vcpu(0)?;
    boot::setup_real_mode(vcpu, GuestAddress(config.entry_point()), &config.registers)?;

    // 5) serial console
    let mut dispatcher = ExitDispatcher::new(config.policy);
    let base = config.serial_port;
    let console = SerialConsole::new(base, out)
        .map_err(|source| Error::Device { location: format!("port {:#x}", base), source })?;
    dispatcher.register_port(PortMatch::range(base..=base.saturating_add(UART_PORTS - 1)), console);

    // 6) loop until exit/timeout
    let report = match config.timeout_ms {
        Some(ms) => watchdog::run_with_watchdog(&mut dispatcher, vcpu, Duration::from_millis(ms))?,
        None => dispatcher.run(vcpu)?,
    };

    hv.release();
    Ok(report)
}

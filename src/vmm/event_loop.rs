use std::io;
use std::ops::{Range, RangeInclusive};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::exit::{ExitEvent, ExitSource, IoAccess, IoDirection, MmioAccess};
use crate::config::{ExitPolicy, UnhandledAccess, UnrecognizedExit};
use crate::error::{Error, Result};

/// A device reachable through port I/O.
pub trait PortDevice: Send {
    fn write(&mut self, port: u16, data: &[u8]) -> io::Result<()>;

    fn read(&mut self, _port: u16, data: &mut [u8]) -> io::Result<()> {
        data.fill(0xff);
        Ok(())
    }
}

/// Write-only port handlers can be plain closures.
impl<F> PortDevice for F
where
    F: FnMut(u16, &[u8]) -> io::Result<()> + Send,
{
    fn write(&mut self, port: u16, data: &[u8]) -> io::Result<()> {
        self(port, data)
    }
}

/// A device reachable through memory-mapped I/O.
pub trait MmioDevice: Send {
    fn write(&mut self, addr: u64, data: &[u8]) -> io::Result<()>;
    fn read(&mut self, addr: u64, data: &mut [u8]) -> io::Result<()>;
}

/// Which port exits a [`PortDevice`] receives. Width and count are only
/// compared when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMatch {
    pub ports: RangeInclusive<u16>,
    pub width: Option<u8>,
    pub count: Option<u32>,
}

impl PortMatch {
    pub fn port(port: u16) -> Self {
        Self::range(port..=port)
    }

    pub fn range(ports: RangeInclusive<u16>) -> Self {
        Self { ports, width: None, count: None }
    }

    pub fn width(mut self, width: u8) -> Self {
        self.width = Some(width);
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    fn matches(&self, io: &IoAccess) -> bool {
        self.ports.contains(&io.port)
            && self.width.map_or(true, |w| w == io.width)
            && self.count.map_or(true, |c| c == io.count)
    }
}

/// Shared flag asking a running loop to stop at its next exit boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Halted,
    /// KVM_EXIT_UNKNOWN: the facility gave no reason.
    Indeterminate,
    Shutdown,
    Stopped,
}

impl Termination {
    pub fn exit_status(&self) -> i32 {
        match self {
            Termination::Halted | Termination::Indeterminate => 0,
            // same as coreutils timeout
            Termination::Stopped => 124,
            // triple fault or reset request: the guest did not finish on its own
            Termination::Shutdown => 125,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStats {
    pub steps: u64,
    pub io_handled: u64,
    pub io_unhandled: u64,
    pub mmio_handled: u64,
    pub mmio_unhandled: u64,
    pub interrupted: u64,
    pub unrecognized: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub termination: Termination,
    pub stats: ExitStats,
}

enum Flow {
    Continue,
    Terminate(Termination),
}

struct PortBinding {
    matcher: PortMatch,
    device: Box<dyn PortDevice>,
}

struct MmioBinding {
    range: Range<u64>,
    device: Box<dyn MmioDevice>,
}

/// Drives an [`ExitSource`] one step at a time and routes every exit.
pub struct ExitDispatcher {
    ports: Vec<PortBinding>,
    mmio: Vec<MmioBinding>,
    policy: ExitPolicy,
    stop: StopHandle,
}

impl ExitDispatcher {
    pub fn new(policy: ExitPolicy) -> Self {
        Self { ports: Vec::new(), mmio: Vec::new(), policy, stop: StopHandle::default() }
    }

    /// First registration wins when matchers overlap.
    pub fn register_port(&mut self, matcher: PortMatch, device: impl PortDevice + 'static) {
        debug!("port device registered for {:#x}..={:#x}", matcher.ports.start(), matcher.ports.end());
        self.ports.push(PortBinding { matcher, device: Box::new(device) });
    }

    pub fn register_mmio(&mut self, range: Range<u64>, device: impl MmioDevice + 'static) {
        debug!("mmio device registered for {:#x}..{:#x}", range.start, range.end);
        self.mmio.push(MmioBinding { range, device: Box::new(device) });
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Steps `cpu` until the first terminal outcome. Fatal outcomes come back as
    /// `Err`; `step()` is never called again after either.
    pub fn run<S: ExitSource + ?Sized>(&mut self, cpu: &mut S) -> Result<RunReport> {
        let mut stats = ExitStats::default();
        let termination = loop {
            if self.stop.is_requested() {
                break Termination::Stopped;
            }
            let event = cpu.step().inspect_err(|e| error!("step failed: {}", e))?;
            stats.steps += 1;
            debug!("exit #{}: {:?}", stats.steps, event);
            match self.dispatch(cpu, event, &mut stats).inspect_err(|e| error!("exit #{}: {}", stats.steps, e))? {
                Flow::Continue => {}
                Flow::Terminate(t) => break t,
            }
        };
        info!("guest terminated: {:?} after {} exits", termination, stats.steps);
        Ok(RunReport { termination, stats })
    }

    fn dispatch<S: ExitSource + ?Sized>(
        &mut self,
        cpu: &mut S,
        event: ExitEvent,
        stats: &mut ExitStats,
    ) -> Result<Flow> {
        match event {
            ExitEvent::Halted => Ok(Flow::Terminate(Termination::Halted)),
            ExitEvent::Unknown => Ok(Flow::Terminate(Termination::Indeterminate)),
            ExitEvent::Shutdown => Ok(Flow::Terminate(Termination::Shutdown)),
            ExitEvent::Error(code) => Err(Error::GuestFault(code)),
            ExitEvent::IoPort(io) => self.dispatch_io(cpu, io, stats).map(|_| Flow::Continue),
            ExitEvent::MemoryMappedAccess(mmio) => self.dispatch_mmio(cpu, mmio, stats).map(|_| Flow::Continue),
            ExitEvent::Interrupted => {
                stats.interrupted += 1;
                if self.stop.is_requested() {
                    Ok(Flow::Terminate(Termination::Stopped))
                } else {
                    Ok(Flow::Continue)
                }
            }
            ExitEvent::Unrecognized(reason) => match self.policy.unrecognized {
                UnrecognizedExit::Continue => {
                    warn!("ignoring unrecognized exit reason {}", reason);
                    stats.unrecognized += 1;
                    Ok(Flow::Continue)
                }
                UnrecognizedExit::Fail => Err(Error::UnrecognizedExit(reason)),
            },
        }
    }

    fn dispatch_io<S: ExitSource + ?Sized>(&mut self, cpu: &mut S, mut io: IoAccess, stats: &mut ExitStats) -> Result<()> {
        let location = || format!("port {:#x}", io.port);
        match self.ports.iter_mut().find(|b| b.matcher.matches(&io)) {
            Some(binding) => {
                stats.io_handled += 1;
                match io.direction {
                    IoDirection::Out => binding
                        .device
                        .write(io.port, &io.data)
                        .map_err(|source| Error::Device { location: location(), source }),
                    IoDirection::In => {
                        binding
                            .device
                            .read(io.port, &mut io.data)
                            .map_err(|source| Error::Device { location: location(), source })?;
                        cpu.complete_read(&io.data)
                    }
                }
            }
            None => {
                stats.io_unhandled += 1;
                let what = format!(
                    "{:?} port {:#x} (width {}, count {})",
                    io.direction, io.port, io.width, io.count
                );
                unhandled(self.policy.unhandled_io, what)?;
                if io.direction == IoDirection::In {
                    io.data.fill(0xff);
                    cpu.complete_read(&io.data)?;
                }
                Ok(())
            }
        }
    }

    fn dispatch_mmio<S: ExitSource + ?Sized>(&mut self, cpu: &mut S, mut mmio: MmioAccess, stats: &mut ExitStats) -> Result<()> {
        let addr = mmio.address;
        let location = || format!("mmio {:#x}", addr);
        match self.mmio.iter_mut().find(|b| b.range.contains(&addr)) {
            Some(binding) => {
                stats.mmio_handled += 1;
                if mmio.is_write {
                    binding
                        .device
                        .write(addr, &mmio.data)
                        .map_err(|source| Error::Device { location: location(), source })
                } else {
                    binding
                        .device
                        .read(addr, &mut mmio.data)
                        .map_err(|source| Error::Device { location: location(), source })?;
                    cpu.complete_read(&mmio.data)
                }
            }
            None => {
                stats.mmio_unhandled += 1;
                let op = if mmio.is_write { "write" } else { "read" };
                unhandled(self.policy.unhandled_mmio, format!("mmio {} at {:#x}", op, addr))?;
                if !mmio.is_write {
                    mmio.data.fill(0);
                    cpu.complete_read(&mmio.data)?;
                }
                Ok(())
            }
        }
    }
}

fn unhandled(policy: UnhandledAccess, what: String) -> Result<()> {
    match policy {
        UnhandledAccess::Ignore => {
            debug!("unhandled {}", what);
            Ok(())
        }
        UnhandledAccess::Warn => {
            warn!("unhandled {}", what);
            Ok(())
        }
        UnhandledAccess::Fail => Err(Error::UnhandledAccess(what)),
    }
}

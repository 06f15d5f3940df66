use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};
use vmm_sys_util::eventfd::EventFd;

use super::event_loop::PortDevice;

/// Interrupt line of the UART. Nothing is wired to it without an in-kernel
/// irqchip, so it only counts.
pub struct EventFdTrigger(EventFd);

impl EventFdTrigger {
    pub fn new() -> io::Result<Self> {
        Ok(Self(EventFd::new(libc::EFD_NONBLOCK)?))
    }
}

impl Trigger for EventFdTrigger {
    type E = io::Error;

    fn trigger(&self) -> io::Result<()> {
        self.0.write(1)
    }
}

/// Size of a UART register block.
pub const UART_PORTS: u16 = 8;

/// 16550 UART on an 8-port block (COM1 at 0x3f8 by default) writing the guest's
/// transmit register to `out`.
pub struct SerialConsole<W: Write + Send> {
    base: u16,
    serial: Serial<EventFdTrigger, NoEvents, W>,
}

impl<W: Write + Send> SerialConsole<W> {
    pub fn new(base: u16, out: W) -> io::Result<Self> {
        Ok(Self { base, serial: Serial::new(EventFdTrigger::new()?, out) })
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    fn offset(&self, port: u16) -> u8 {
        port.wrapping_sub(self.base) as u8
    }
}

impl<W: Write + Send> PortDevice for SerialConsole<W> {
    fn write(&mut self, port: u16, data: &[u8]) -> io::Result<()> {
        let offset = self.offset(port);
        for &byte in data {
            self.serial
                .write(offset, byte)
                .map_err(|e| io::Error::other(format!("serial write: {:?}", e)))?;
        }
        Ok(())
    }

    fn read(&mut self, port: u16, data: &mut [u8]) -> io::Result<()> {
        let offset = self.offset(port);
        for byte in data.iter_mut() {
            *byte = self.serial.read(offset);
        }
        Ok(())
    }
}

/// Cloneable in-memory sink for capturing console output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

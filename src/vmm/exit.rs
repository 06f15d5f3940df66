use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// A port I/O exit. `data` holds `width * count` bytes copied out of the run
/// structure (for `In`, the bytes the guest will receive once completed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoAccess {
    pub direction: IoDirection,
    pub port: u16,
    pub width: u8,
    pub count: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmioAccess {
    pub address: u64,
    pub is_write: bool,
    pub data: Vec<u8>,
}

/// Why the guest returned control to the host, decoded right after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitEvent {
    Unknown,
    Halted,
    Shutdown,
    IoPort(IoAccess),
    MemoryMappedAccess(MmioAccess),
    /// The facility could not enter or continue the guest.
    Error(u64),
    /// The blocking run call was cut short by a host signal.
    Interrupted,
    Unrecognized(u32),
}

/// Something that can be stepped and produces exits: a vCPU, or a test double.
pub trait ExitSource {
    /// Resumes the guest until the next exit.
    fn step(&mut self) -> Result<ExitEvent>;

    /// Supplies the data for the read exit returned by the last `step`.
    fn complete_read(&mut self, data: &[u8]) -> Result<()>;
}

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// COM1 data register.
pub const COM1_PORT: u16 = 0x3f8;

/// What to do with an I/O or MMIO access no device claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledAccess {
    #[default]
    Ignore,
    Warn,
    Fail,
}

/// What to do with an exit reason the engine does not decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnrecognizedExit {
    Continue,
    #[default]
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitPolicy {
    pub unhandled_io: UnhandledAccess,
    pub unhandled_mmio: UnhandledAccess,
    pub unrecognized: UnrecognizedExit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub slot: u32,
    pub guest_base: u64,
    pub size: u64,
}

/// Initial general-purpose register values. Anything not listed starts at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rflags: u64,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rsp: 0,
            rbp: 0,
            // bit 1 is reserved and must be set
            rflags: 0x2,
        }
    }
}

/// Main configuration for one guest run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Guest-physical memory layout
    pub memory: Vec<RegionConfig>,
    /// Where the raw image is copied
    pub load_address: u64,
    /// First instruction (None = load_address)
    pub entry: Option<u64>,
    pub registers: RegisterConfig,
    /// Base of the 8-port UART block
    pub serial_port: u16,
    pub policy: ExitPolicy,
    /// Watchdog timeout; None runs until the guest exits on its own
    pub timeout_ms: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory: vec![RegionConfig { slot: 0, guest_base: 0x1000, size: 0x1000 }],
            load_address: 0x1000,
            entry: None,
            registers: RegisterConfig { rax: 3, rbx: 4, ..RegisterConfig::default() },
            serial_port: COM1_PORT,
            policy: ExitPolicy::default(),
            timeout_ms: None,
        }
    }
}

impl VmConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(Error::ConfigIo)?;
        Self::from_json(&text)
    }

    pub fn entry_point(&self) -> u64 {
        self.entry.unwrap_or(self.load_address)
    }
}

use std::fmt;
use std::io;

use thiserror::Error;

/// Facility errors are plain errno values from the KVM ioctls.
pub type FacilityError = kvm_ioctls::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every failure the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnavailableFacility,
    CreationFailed,
    AllocationFailed,
    RegionConflict,
    RegistrationFailed,
    InvalidConfig,
    RegisterSetFailed,
    RegisterGetFailed,
    RunFailed,
    UnrecognizedExit,
    UnhandledAccess,
    Device,
    OutOfBounds,
    UnmappedAddress,
    Watchdog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Vm,
    Vcpu,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Vm => f.write_str("VM"),
            Resource::Vcpu => f.write_str("vCPU"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open /dev/kvm: {0}")]
    OpenFacility(#[source] FacilityError),

    #[error("unsupported KVM API version {0} (expected 12)")]
    UnsupportedApi(i32),

    #[error("KVM capability {0} is not available")]
    MissingCapability(&'static str),

    #[error("hypervisor handle already released")]
    Released,

    #[error("failed to create {resource}: {source}")]
    Create {
        resource: Resource,
        #[source]
        source: FacilityError,
    },

    #[error("invalid memory region (slot {slot}, base {guest_base:#x}, size {size:#x}): {reason}")]
    InvalidRegion {
        slot: u32,
        guest_base: u64,
        size: u64,
        reason: &'static str,
    },

    #[error("failed to allocate {size:#x} bytes of guest memory: {reason}")]
    Allocation { size: u64, reason: String },

    #[error("memory slot {0} is already in use")]
    SlotInUse(u32),

    #[error("range [{guest_base:#x}, {end:#x}) overlaps memory slot {existing}")]
    RangeOverlap {
        guest_base: u64,
        end: u64,
        existing: u32,
    },

    #[error("failed to register memory slot {slot}: {source}")]
    RegisterMemory {
        slot: u32,
        #[source]
        source: FacilityError,
    },

    #[error("access [{offset:#x}, +{len:#x}) is outside a region of {size:#x} bytes")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("guest address {0:#x} is not backed by any memory region")]
    UnmappedAddress(u64),

    #[error("entry point {0:#x} is not reachable from real mode")]
    EntryOutOfRange(u64),

    #[error("failed to set {what}: {source}")]
    SetRegisters {
        what: &'static str,
        #[source]
        source: FacilityError,
    },

    #[error("failed to get {what}: {source}")]
    GetRegisters {
        what: &'static str,
        #[source]
        source: FacilityError,
    },

    #[error("vCPU {vcpu} failed to run: {source}")]
    Run {
        vcpu: u64,
        #[source]
        source: FacilityError,
    },

    #[error("guest entry failed with facility code {0:#x}")]
    GuestFault(u64),

    #[error("unrecognized exit reason {0}")]
    UnrecognizedExit(u32),

    #[error("unhandled {0}")]
    UnhandledAccess(String),

    #[error("device at {location} failed: {source}")]
    Device {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[source] io::Error),

    #[error("failed to set up watchdog: {0}")]
    Watchdog(#[source] FacilityError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OpenFacility(_)
            | Error::UnsupportedApi(_)
            | Error::MissingCapability(_)
            | Error::Released => ErrorKind::UnavailableFacility,
            Error::Create { .. } => ErrorKind::CreationFailed,
            Error::Allocation { .. } => ErrorKind::AllocationFailed,
            Error::SlotInUse(_) | Error::RangeOverlap { .. } => ErrorKind::RegionConflict,
            Error::RegisterMemory { .. } => ErrorKind::RegistrationFailed,
            Error::InvalidRegion { .. }
            | Error::EntryOutOfRange(_)
            | Error::Config(_)
            | Error::ConfigIo(_) => ErrorKind::InvalidConfig,
            Error::SetRegisters { .. } => ErrorKind::RegisterSetFailed,
            Error::GetRegisters { .. } => ErrorKind::RegisterGetFailed,
            Error::Run { .. } | Error::GuestFault(_) => ErrorKind::RunFailed,
            Error::UnrecognizedExit(_) => ErrorKind::UnrecognizedExit,
            Error::UnhandledAccess(_) => ErrorKind::UnhandledAccess,
            Error::Device { .. } => ErrorKind::Device,
            Error::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Error::UnmappedAddress(_) => ErrorKind::UnmappedAddress,
            Error::Watchdog(_) => ErrorKind::Watchdog,
        }
    }

    /// Facility-level failure code, when the error carries one. Fault codes
    /// that do not fit an `i64` give `None`; match on `GuestFault` for the raw value.
    pub fn code(&self) -> Option<i64> {
        match self {
            Error::OpenFacility(e)
            | Error::Create { source: e, .. }
            | Error::RegisterMemory { source: e, .. }
            | Error::SetRegisters { source: e, .. }
            | Error::GetRegisters { source: e, .. }
            | Error::Run { source: e, .. }
            | Error::Watchdog(e) => Some(i64::from(e.errno())),
            Error::GuestFault(code) => i64::try_from(*code).ok(),
            Error::UnrecognizedExit(reason) => Some(i64::from(*reason)),
            _ => None,
        }
    }

    /// Process exit status for the CLI, one per initialization stage.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Create { resource: Resource::Vm, .. } => 2,
            Error::Create { resource: Resource::Vcpu, .. } => 4,
            _ => match self.kind() {
                ErrorKind::UnavailableFacility => 1,
                ErrorKind::CreationFailed => 2,
                ErrorKind::AllocationFailed => 3,
                ErrorKind::RegionConflict | ErrorKind::RegistrationFailed => 5,
                ErrorKind::InvalidConfig => 6,
                ErrorKind::RegisterSetFailed => 7,
                ErrorKind::RegisterGetFailed => 8,
                ErrorKind::RunFailed => 9,
                ErrorKind::UnrecognizedExit => 10,
                ErrorKind::UnhandledAccess => 11,
                ErrorKind::Device => 12,
                ErrorKind::OutOfBounds | ErrorKind::UnmappedAddress => 13,
                ErrorKind::Watchdog => 14,
            },
        }
    }
}

#[cfg(feature = "python")]
pub fn pyerr(err: Error) -> pyo3::PyErr {
    pyo3::exceptions::PyRuntimeError::new_err(format!("{} ({:?})", err, err.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_failures_keep_distinct_exit_codes() {
        let vm = Error::Create { resource: Resource::Vm, source: FacilityError::new(libc::ENOMEM) };
        let vcpu = Error::Create { resource: Resource::Vcpu, source: FacilityError::new(libc::EEXIST) };
        assert_eq!(vm.kind(), ErrorKind::CreationFailed);
        assert_eq!(vcpu.kind(), ErrorKind::CreationFailed);
        assert_eq!(vm.exit_code(), 2);
        assert_eq!(vcpu.exit_code(), 4);
    }

    #[test]
    fn run_failures_expose_the_facility_code() {
        let err = Error::Run { vcpu: 0, source: FacilityError::new(libc::EFAULT) };
        assert_eq!(err.kind(), ErrorKind::RunFailed);
        assert_eq!(err.code(), Some(i64::from(libc::EFAULT)));

        let fault = Error::GuestFault(0x80000021);
        assert_eq!(fault.kind(), ErrorKind::RunFailed);
        assert_eq!(fault.code(), Some(0x80000021));

        // hardware reasons with the top bit set do not fit and are not wrapped
        assert_eq!(Error::GuestFault(1 << 63).code(), None);
        assert_eq!(Error::GuestFault(u64::MAX).code(), None);
    }

    #[test]
    fn conflicts_share_a_kind() {
        assert_eq!(Error::SlotInUse(3).kind(), ErrorKind::RegionConflict);
        let overlap = Error::RangeOverlap { guest_base: 0x1000, end: 0x3000, existing: 1 };
        assert_eq!(overlap.kind(), ErrorKind::RegionConflict);
        assert!(overlap.to_string().contains("slot 1"));
    }
}

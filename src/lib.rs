//! Minimal single-guest KVM execution engine.
//!
//! A [`Hypervisor`] owns the VMs it creates; a [`Vm`] owns its memory regions
//! and vCPUs; an [`ExitDispatcher`] steps one vCPU and routes each exit to the
//! registered port or MMIO devices until the guest halts, fails, or is stopped.

#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use pyo3::types::{PyBytes, PyDict};


pub mod vmm;
pub mod types;
pub mod error;
pub mod config;


pub use config::{ExitPolicy, RegionConfig, RegisterConfig, UnhandledAccess, UnrecognizedExit, VmConfig};
pub use error::{Error, ErrorKind, Result};
pub use types::RunResult;
pub use vmm::event_loop::{ExitDispatcher, MmioDevice, PortDevice, PortMatch, RunReport, StopHandle, Termination};
pub use vmm::exit::{ExitEvent, ExitSource, IoAccess, IoDirection, MmioAccess};
pub use vmm::kvm_ctx::Hypervisor;
pub use vmm::memory::MemoryRegion;
pub use vmm::run::{run_guest, run_with_console};
pub use vmm::vcpu::Vcpu;
pub use vmm::vm::Vm;


#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(signature = (code, opts=None))]
fn run<'py>(py: Python<'py>, code: &Bound<'py, PyBytes>, opts: Option<Bound<'py, PyDict>>) -> PyResult<RunResult> {
    let cfg = types::config_from_py(opts.as_ref())?;
    let code = code.as_bytes().to_vec();
    py.allow_threads(|| vmm::run::run_guest(&code, &cfg))
        .map_err(error::pyerr)
}


#[cfg(feature = "python")]
#[pymodule]
fn minivmm(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run, m)?)?;
    m.add_class::<RunResult>()?;
    Ok(())
}

use serde::{Deserialize, Serialize};
#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use pyo3::types::PyDict;

#[cfg(feature = "python")]
use crate::config::VmConfig;
use crate::vmm::event_loop::{ExitStats, RunReport, Termination};


/// Outcome of one guest run, with the console output captured.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    #[cfg_attr(feature = "python", pyo3(get))] pub console: String,
    #[cfg_attr(feature = "python", pyo3(get))] pub exit_status: i32,
    #[cfg_attr(feature = "python", pyo3(get))] pub steps: u64,
    pub termination: Termination,
    pub stats: ExitStats,
}


impl RunResult {
    pub fn new(report: RunReport, console: String) -> Self {
        Self {
            console,
            exit_status: report.termination.exit_status(),
            steps: report.stats.steps,
            termination: report.termination,
            stats: report.stats,
        }
    }
}


#[cfg(feature = "python")]
#[pymethods]
impl RunResult {
    #[getter]
    fn termination(&self) -> String {
        format!("{:?}", self.termination).to_lowercase()
    }
}


/// Builds a [`VmConfig`] from the optional options dict of `minivmm.run`.
/// Keys not given keep the demo defaults.
#[cfg(feature = "python")]
pub fn config_from_py<'py>(d: Option<&Bound<'py, PyDict>>) -> PyResult<VmConfig> {
    let mut cfg = VmConfig::default();
    let Some(d) = d else { return Ok(cfg) };
    if let Some(v) = d.get_item("rax")? { cfg.registers.rax = v.extract()?; }
    if let Some(v) = d.get_item("rbx")? { cfg.registers.rbx = v.extract()?; }
    if let Some(v) = d.get_item("load_address")? {
        cfg.load_address = v.extract()?;
        cfg.memory[0].guest_base = cfg.load_address & !(crate::vmm::memory::PAGE_SIZE - 1);
    }
    if let Some(v) = d.get_item("mem_size")? { cfg.memory[0].size = v.extract()?; }
    if let Some(v) = d.get_item("entry")? { cfg.entry = Some(v.extract()?); }
    cfg.timeout_ms = d
        .get_item("timeout_ms")?
        .map(|v| v.extract::<u64>())
        .transpose()?
        .filter(|&t| t > 0);
    Ok(cfg)
}

//! Bounded runs. `KVM_RUN` only returns when the guest exits, so a stop request
//! alone cannot end a guest that spins without I/O; the watchdog also signals
//! the worker thread so the ioctl fails with `EINTR`.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use libc::{c_int, c_void, siginfo_t};
use log::{debug, warn};
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use super::event_loop::{ExitDispatcher, RunReport};
use super::exit::ExitSource;
use crate::error::{Error, FacilityError, Result};

const KICK_INTERVAL: Duration = Duration::from_millis(10);

pub fn kick_signal() -> c_int {
    SIGRTMIN()
}

extern "C" fn handle_kick(_num: c_int, _info: *mut siginfo_t, _unused: *mut c_void) {}

fn install_kick_handler() -> Result<()> {
    static INSTALLED: OnceLock<std::result::Result<(), c_int>> = OnceLock::new();
    let installed =
        *INSTALLED.get_or_init(|| register_signal_handler(kick_signal(), handle_kick).map_err(|e| e.errno()));
    installed.map_err(|errno| Error::Watchdog(FacilityError::new(errno)))
}

enum WorkerMsg {
    Started(libc::pthread_t),
    Finished,
}

/// Runs `dispatcher` over `cpu` on a scoped worker thread. When `timeout`
/// elapses first, requests a stop and keeps kicking the worker until it returns
/// (the loop then ends as `Stopped`).
pub fn run_with_watchdog<S>(dispatcher: &mut ExitDispatcher, cpu: &mut S, timeout: Duration) -> Result<RunReport>
where
    S: ExitSource + Send + ?Sized,
{
    install_kick_handler()?;
    let stop = dispatcher.stop_handle();

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        let worker = scope.spawn(move || {
            // SAFETY: pthread_self has no preconditions.
            let _ = tx.send(WorkerMsg::Started(unsafe { libc::pthread_self() }));
            let result = dispatcher.run(cpu);
            let _ = tx.send(WorkerMsg::Finished);
            result
        });

        let mut tid = None;
        let mut wait = timeout;
        let mut expired = false;
        loop {
            match rx.recv_timeout(wait) {
                Ok(WorkerMsg::Started(t)) => tid = Some(t),
                Ok(WorkerMsg::Finished) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if !expired {
                        warn!("watchdog expired after {:?}; stopping guest", timeout);
                        stop.request_stop();
                        expired = true;
                        wait = KICK_INTERVAL;
                    }
                    if let Some(t) = tid {
                        debug!("kicking vcpu thread");
                        // SAFETY: the worker is still running inside this scope, so `t` is live.
                        unsafe { libc::pthread_kill(t, kick_signal()) };
                    }
                }
            }
        }

        match worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExitPolicy;
    use crate::vmm::event_loop::Termination;
    use crate::vmm::exit::{ExitEvent, IoAccess, IoDirection};

    /// A guest that keeps poking an unclaimed port forever.
    struct Spinner {
        steps: u64,
    }

    impl ExitSource for Spinner {
        fn step(&mut self) -> Result<ExitEvent> {
            self.steps += 1;
            thread::sleep(Duration::from_micros(100));
            Ok(ExitEvent::IoPort(IoAccess {
                direction: IoDirection::Out,
                port: 0x80,
                width: 1,
                count: 1,
                data: vec![0],
            }))
        }

        fn complete_read(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct Quick;

    impl ExitSource for Quick {
        fn step(&mut self) -> Result<ExitEvent> {
            Ok(ExitEvent::Halted)
        }

        fn complete_read(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn endless_guest_is_stopped() {
        let mut dispatcher = ExitDispatcher::new(ExitPolicy::default());
        let mut cpu = Spinner { steps: 0 };
        let report = run_with_watchdog(&mut dispatcher, &mut cpu, Duration::from_millis(50)).unwrap();
        assert_eq!(report.termination, Termination::Stopped);
        assert!(cpu.steps > 0);
        assert_eq!(report.stats.steps, cpu.steps);
    }

    #[test]
    fn guest_finishing_in_time_is_untouched() {
        let mut dispatcher = ExitDispatcher::new(ExitPolicy::default());
        let report = run_with_watchdog(&mut dispatcher, &mut Quick, Duration::from_secs(5)).unwrap();
        assert_eq!(report.termination, Termination::Halted);
        assert!(!dispatcher.stop_handle().is_requested());
    }
}

//! Reclaiming running slots.
//!
//! Reclaiming takes a slot out of `running`, makes sure its hypervisor is
//! gone, removes its scratch directory and returns it to `free`. The pool
//! lock is only held for the lookup and the final update, never while
//! waiting for a process to exit.

use crate::error::{Error, Result};
use crate::hypervisor;
use crate::process::{self, StopOutcome, DEFAULT_STOP_TIMEOUT};
use crate::provision::remove_scratch;
use crate::record::{SlotState, VmRecord};
use crate::store::PoolStore;
use std::time::Duration;

/// How the hypervisor of a reclaimed slot went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No hypervisor was ever recorded for the lease.
    NeverStarted,
    /// The hypervisor had already exited.
    AlreadyExited,
    /// The hypervisor exited after SIGTERM.
    Terminated,
    /// The hypervisor had to be killed.
    Killed,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::NeverStarted => write!(f, "never started"),
            Termination::AlreadyExited => write!(f, "already exited"),
            Termination::Terminated => write!(f, "terminated"),
            Termination::Killed => write!(f, "killed"),
        }
    }
}

/// Result of a successful reclaim.
#[derive(Debug, Clone)]
pub struct Reclaimed {
    /// The record as it was before release.
    pub record: VmRecord,
    /// What happened to the hypervisor.
    pub termination: Termination,
    /// Scratch directory removal failure. The slot is freed regardless.
    pub cleanup_error: Option<String>,
}

/// Returns running slots to the free collection.
#[derive(Debug, Clone)]
pub struct Reclaimer {
    store: PoolStore,
    timeout: Duration,
    force: bool,
    self_pid: i32,
}

impl Reclaimer {
    /// Create a reclaimer with the default stop timeout.
    pub fn new(store: PoolStore) -> Self {
        Self {
            store,
            timeout: DEFAULT_STOP_TIMEOUT,
            force: false,
            self_pid: std::process::id() as i32,
        }
    }

    /// How long to wait for the hypervisor after SIGTERM.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// SIGKILL the hypervisor if it outlives the timeout.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Reclaim the running slot `id`.
    ///
    /// Fails with `NotRunning` if there is no such slot and with
    /// `InvalidState` if another live invocation is still setting it up.
    /// If the hypervisor cannot be stopped the record stays in `running`.
    pub fn reclaim(&self, id: u32) -> Result<Reclaimed> {
        let record = self.store.read(|pool| {
            pool.find_running(id)
                .cloned()
                .ok_or(Error::NotRunning(id))
        })?;

        if record.state == SlotState::Setup
            && record.supervisor_pid != Some(self.self_pid)
            && record.is_supervisor_alive()
        {
            return Err(Error::InvalidState {
                id,
                expected: "running".to_string(),
                actual: format!(
                    "being set up by pid {}",
                    record.supervisor_pid.unwrap_or_default()
                ),
            });
        }

        let termination = self.terminate(&record)?;
        self.finish(&record, termination)
    }

    /// Release the caller's own lease after its hypervisor exited.
    ///
    /// Only the exact lease is touched: if the slot was already reclaimed,
    /// and perhaps leased again, this returns `Ok(None)`.
    pub fn release(&self, lease: &VmRecord) -> Result<Option<Reclaimed>> {
        let current = self.store.read(|pool| {
            Ok(pool
                .find_running(lease.id)
                .filter(|r| r.same_lease(lease))
                .cloned())
        })?;

        let Some(record) = current else {
            tracing::debug!(id = lease.id, "lease already reclaimed");
            return Ok(None);
        };

        let termination = self.terminate(&record)?;
        match self.finish(&record, termination) {
            Ok(reclaimed) => Ok(Some(reclaimed)),
            Err(Error::NotRunning(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn terminate(&self, record: &VmRecord) -> Result<Termination> {
        let Some(tmpdir) = &record.tmpdir else {
            return Ok(Termination::NeverStarted);
        };
        // A setup lease whose supervisor died before commit may still have
        // a hypervisor, known only through its pid file
        let Some(pid) = record.pid.or_else(|| hypervisor::read_pidfile(tmpdir)) else {
            return Ok(Termination::NeverStarted);
        };

        tracing::info!(id = record.id, pid, "stopping vm");
        match process::stop_vm(pid, tmpdir, self.timeout, self.force) {
            Ok(StopOutcome::AlreadyExited) => Ok(Termination::AlreadyExited),
            Ok(StopOutcome::Terminated) => Ok(Termination::Terminated),
            Ok(StopOutcome::Killed) => Ok(Termination::Killed),
            Ok(StopOutcome::StillAlive) => Err(Error::kill(
                record.id,
                format!(
                    "process {} still running after {}{}",
                    pid,
                    humantime::format_duration(self.timeout),
                    if self.force { " and SIGKILL" } else { " (use --force)" }
                ),
            )),
            Err(e) => Err(Error::kill(record.id, format!("process {}: {}", pid, e))),
        }
    }

    fn finish(&self, record: &VmRecord, termination: Termination) -> Result<Reclaimed> {
        let cleanup_error = match &record.tmpdir {
            Some(tmpdir) => remove_scratch(tmpdir).err().map(|e| {
                tracing::warn!(
                    id = record.id,
                    tmpdir = %tmpdir.display(),
                    error = %e,
                    "failed to remove scratch directory"
                );
                format!("{}: {}", tmpdir.display(), e)
            }),
            None => None,
        };

        self.store.transaction(|pool| {
            let mut current = pool
                .take_running(|r| r.same_lease(record))
                .ok_or(Error::NotRunning(record.id))?;
            current.release();
            pool.push_free(current);
            Ok(())
        })?;

        tracing::info!(id = record.id, %termination, "slot reclaimed");
        Ok(Reclaimed {
            record: record.clone(),
            termination,
            cleanup_error,
        })
    }
}

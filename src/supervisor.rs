//! VM lifecycle supervision.
//!
//! A [`Supervisor`] drives one VM through its lease:
//!
//! 1. `allocate` takes the lowest free slot and records it as `setup`
//! 2. `provision` creates the scratch directory and its contents, and
//!    `record_scratch` stores its path on the `setup` record
//! 3. `spawn` starts the hypervisor, which writes its pid file there
//! 4. `commit` records the running hypervisor
//! 5. `supervise` waits for the hypervisor to exit or for a signal
//! 6. `release` hands the slot back through the [`Reclaimer`]
//!
//! Any failure between 1 and 4 rolls the lease back so the slot is never
//! lost.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::hypervisor;
use crate::provision::{self, remove_scratch, Provisioned};
use crate::reclaim::{Reclaimed, Reclaimer};
use crate::record::{SlotState, VmRecord};
use crate::request::VmRequest;
use crate::store::PoolStore;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};

/// Why supervision ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The hypervisor exited with a status code.
    Exited(i32),
    /// The hypervisor was killed by a signal it did not expect.
    Signaled(i32),
    /// This invocation received a signal and stopped the hypervisor.
    Interrupted(&'static str),
    /// Waiting on the hypervisor failed.
    Lost(String),
}

impl ExitReason {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::Exited(code),
            (None, Some(sig)) => ExitReason::Signaled(sig),
            (None, None) => ExitReason::Lost(format!("unknown exit status {}", status)),
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with status {}", code),
            ExitReason::Signaled(sig) => write!(f, "killed by signal {}", sig),
            ExitReason::Interrupted(name) => write!(f, "stopped on {}", name),
            ExitReason::Lost(reason) => write!(f, "lost: {}", reason),
        }
    }
}

/// A committed VM and its hypervisor process.
#[derive(Debug)]
pub struct RunningVm {
    /// The committed record.
    pub record: VmRecord,
    /// The hypervisor.
    pub child: Child,
}

/// Drives VM leases for one invocation.
#[derive(Debug, Clone)]
pub struct Supervisor {
    store: PoolStore,
    config: PoolConfig,
    self_pid: i32,
}

impl Supervisor {
    /// Create a supervisor for the configured pool.
    pub fn new(store: PoolStore, config: PoolConfig) -> Self {
        Self {
            store,
            config,
            self_pid: std::process::id() as i32,
        }
    }

    /// Lease the lowest free slot to `owner`.
    pub fn allocate(&self, owner: &str) -> Result<VmRecord> {
        let lease = self.store.transaction(|pool| {
            let mut record = pool.pop_free().ok_or(Error::NoFreeSlots)?;
            record.state = SlotState::Setup;
            record.owner = Some(owner.to_string());
            record.supervisor_pid = Some(self.self_pid);
            pool.running.push(record.clone());
            Ok(record)
        })?;

        tracing::info!(id = lease.id, owner, "slot allocated");
        Ok(lease)
    }

    /// Create the scratch resources for a lease.
    pub fn provision(&self, lease: &VmRecord, request: &VmRequest) -> Result<Provisioned> {
        provision::provision(lease, request, &self.config.tools)
    }

    /// Store the scratch directory on the `setup` record.
    ///
    /// A reclaim after a crash can then remove the directory and find a
    /// hypervisor through its pid file.
    pub fn record_scratch(&self, lease: &VmRecord, provisioned: &Provisioned) -> Result<()> {
        self.store.transaction(|pool| {
            let record = pool
                .running
                .iter_mut()
                .find(|r| self.is_own_setup(r, lease))
                .ok_or_else(|| Error::InvalidState {
                    id: lease.id,
                    expected: "setup".to_string(),
                    actual: "reclaimed".to_string(),
                })?;
            record.tmpdir = Some(provisioned.tmpdir.clone());
            Ok(())
        })
    }

    /// Start the hypervisor for a provisioned lease.
    pub fn spawn(
        &self,
        lease: &VmRecord,
        request: &VmRequest,
        provisioned: &Provisioned,
    ) -> Result<Child> {
        let args = hypervisor::hypervisor_args(lease, request, provisioned, &self.config.network);
        hypervisor::spawn(&self.config.tools, &args)
    }

    /// Undo a lease that never reached `running`.
    ///
    /// Returns the slot to `free` if the lease is still ours, then removes
    /// the scratch directory.
    pub fn rollback(&self, lease: &VmRecord, provisioned: Option<&Provisioned>) -> Result<()> {
        let restored = self.store.transaction(|pool| {
            match pool.take_running(|r| self.is_own_setup(r, lease)) {
                Some(mut record) => {
                    record.release();
                    pool.push_free(record);
                    Ok(true)
                }
                None => Ok(false),
            }
        });

        if let Some(provisioned) = provisioned {
            if let Err(e) = remove_scratch(&provisioned.tmpdir) {
                tracing::warn!(
                    id = lease.id,
                    tmpdir = %provisioned.tmpdir.display(),
                    error = %e,
                    "failed to remove scratch directory"
                );
            }
        }

        if restored? {
            tracing::info!(id = lease.id, "lease rolled back");
        } else {
            tracing::warn!(id = lease.id, "lease was already reclaimed");
        }
        Ok(())
    }

    /// Record the running hypervisor for a lease.
    ///
    /// Fails if the lease was reclaimed while it was being set up.
    pub fn commit(
        &self,
        lease: &VmRecord,
        request: &VmRequest,
        provisioned: &Provisioned,
        pid: i32,
    ) -> Result<VmRecord> {
        let record = self.store.transaction(|pool| {
            let record = pool
                .running
                .iter_mut()
                .find(|r| self.is_own_setup(r, lease))
                .ok_or_else(|| Error::InvalidState {
                    id: lease.id,
                    expected: "setup".to_string(),
                    actual: "reclaimed".to_string(),
                })?;

            record.state = SlotState::Running;
            record.pid = Some(pid);
            record.tmpdir = Some(provisioned.tmpdir.clone());
            record.network_mode = Some(request.network);
            record.image = Some(request.image.clone());
            record.kernel = request.kernel.clone();
            record.started_at = Some(crate::util::current_timestamp());
            Ok(record.clone())
        })?;

        tracing::info!(id = record.id, pid, "vm running");
        Ok(record)
    }

    /// Allocate, provision, spawn and commit a VM for `owner`.
    ///
    /// Must be called from within a tokio runtime. On failure nothing is
    /// left behind: the slot is free again and the hypervisor is stopped.
    pub async fn start(&self, owner: &str, request: &VmRequest) -> Result<RunningVm> {
        let lease = self.allocate(owner)?;

        let provisioned = match self.provision(&lease, request) {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.rollback_logged(&lease, None);
                return Err(e);
            }
        };

        if let Err(e) = self.record_scratch(&lease, &provisioned) {
            self.rollback_logged(&lease, Some(&provisioned));
            return Err(e);
        }

        let mut child = match self.spawn(&lease, request, &provisioned) {
            Ok(child) => child,
            Err(e) => {
                self.rollback_logged(&lease, Some(&provisioned));
                return Err(e);
            }
        };

        let pid = child.id().map(|pid| pid as i32).unwrap_or_default();
        match self.commit(&lease, request, &provisioned, pid) {
            Ok(record) => Ok(RunningVm { record, child }),
            Err(e) => {
                tracing::warn!(id = lease.id, error = %e, "commit failed, stopping hypervisor");
                self.stop_child(&mut child).await;
                self.rollback_logged(&lease, Some(&provisioned));
                Err(e)
            }
        }
    }

    /// Wait for the hypervisor to exit.
    ///
    /// SIGINT, SIGTERM and SIGHUP stop the hypervisor instead of this
    /// invocation, so the lease is always released afterwards.
    pub async fn supervise(&self, vm: &mut RunningVm) -> ExitReason {
        let signals = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        );
        let (mut sigint, mut sigterm, mut sighup) = match signals {
            (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
            _ => {
                tracing::warn!("failed to install signal handlers");
                return match vm.child.wait().await {
                    Ok(status) => ExitReason::from_status(status),
                    Err(e) => ExitReason::Lost(e.to_string()),
                };
            }
        };

        let interrupted = tokio::select! {
            status = vm.child.wait() => {
                return match status {
                    Ok(status) => {
                        tracing::info!(id = vm.record.id, %status, "hypervisor exited");
                        ExitReason::from_status(status)
                    }
                    Err(e) => ExitReason::Lost(e.to_string()),
                };
            }
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sighup.recv() => "SIGHUP",
        };

        tracing::warn!(id = vm.record.id, signal = interrupted, "stopping vm");
        self.stop_child(&mut vm.child).await;
        ExitReason::Interrupted(interrupted)
    }

    /// Release a lease through the reclaimer after supervision ended.
    pub fn release(&self, vm: &RunningVm) -> Result<Option<Reclaimed>> {
        self.reclaimer()?.force(true).release(&vm.record)
    }

    fn reclaimer(&self) -> Result<Reclaimer> {
        Ok(Reclaimer::new(self.store.clone()).timeout(self.config.stop_timeout()?))
    }

    fn is_own_setup(&self, record: &VmRecord, lease: &VmRecord) -> bool {
        record.id == lease.id
            && record.state == SlotState::Setup
            && record.supervisor_pid == lease.supervisor_pid
    }

    fn rollback_logged(&self, lease: &VmRecord, provisioned: Option<&Provisioned>) {
        if let Err(e) = self.rollback(lease, provisioned) {
            tracing::error!(id = lease.id, error = %e, "rollback failed");
        }
    }

    /// SIGTERM the hypervisor, SIGKILL it after the stop timeout, reap it.
    pub(crate) async fn stop_child(&self, child: &mut Child) {
        let timeout = self
            .config
            .stop_timeout()
            .unwrap_or(crate::process::DEFAULT_STOP_TIMEOUT);

        if let Some(pid) = child.id() {
            if let Err(e) = crate::process::terminate(pid as i32) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "hypervisor stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for hypervisor");
            }
            Err(_) => {
                tracing::warn!(
                    timeout = %humantime::format_duration(timeout),
                    "hypervisor ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill hypervisor");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::pool;
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    const TEST_STOP_TIMEOUT: Duration = Duration::from_millis(300);

    /// Signals reach every `supervise` in the process, so tests that
    /// supervise take turns.
    static SUPERVISE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn supervise_turn() -> std::sync::MutexGuard<'static, ()> {
        SUPERVISE.lock().unwrap_or_else(|e| e.into_inner())
    }

    struct Fixture {
        _state: TempDir,
        _tools: TempDir,
        scratch: TempDir,
        image: PathBuf,
        store: PoolStore,
        config: PoolConfig,
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    fn fixture(count: u32, hypervisor_body: &str) -> Fixture {
        let state = tempfile::tempdir().unwrap();
        let tools = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let image = tools.path().join("base.img");
        std::fs::write(&image, b"").unwrap();

        let config = PoolConfig {
            state_dir: state.path().to_path_buf(),
            scratch_base: scratch.path().to_path_buf(),
            stop_timeout: humantime::format_duration(TEST_STOP_TIMEOUT).to_string(),
            tools: ToolConfig {
                hypervisor: script(tools.path(), "fake-qemu.sh", hypervisor_body),
                disk_allocator: script(tools.path(), "fake-fallocate.sh", ": > \"$3\"\n"),
                ..Default::default()
            },
            ..Default::default()
        };
        pool::regenerate(&config, count).unwrap();
        let store = PoolStore::from_config(&config);

        Fixture {
            _state: state,
            _tools: tools,
            scratch,
            image,
            store,
            config,
        }
    }

    impl Fixture {
        fn supervisor(&self) -> Supervisor {
            Supervisor::new(self.store.clone(), self.config.clone())
        }

        fn request(&self) -> VmRequest {
            VmRequest::new(&self.image, self.scratch.path(), "1G")
        }

        fn counts(&self) -> (usize, usize) {
            self.store
                .read(|pool| Ok((pool.free.len(), pool.running.len())))
                .unwrap()
        }

        fn scratch_entries(&self) -> usize {
            std::fs::read_dir(self.scratch.path()).unwrap().count()
        }
    }

    #[test]
    fn test_allocate_lowest_first_then_exhausted() {
        let f = fixture(3, "exit 0\n");
        let supervisor = f.supervisor();

        let ids: Vec<u32> = (0..3)
            .map(|_| supervisor.allocate("alice").unwrap().id)
            .collect();
        assert_eq!(ids, [0, 1, 2]);

        assert!(matches!(supervisor.allocate("bob"), Err(Error::NoFreeSlots)));
        assert_eq!(f.counts(), (0, 3));
    }

    #[test]
    fn test_allocate_records_setup_lease() {
        let f = fixture(2, "exit 0\n");
        let lease = f.supervisor().allocate("alice").unwrap();

        assert_eq!(lease.state, SlotState::Setup);
        assert_eq!(lease.owner.as_deref(), Some("alice"));
        assert_eq!(lease.supervisor_pid, Some(std::process::id() as i32));

        let stored = f
            .store
            .read(|pool| Ok(pool.find_running(lease.id).cloned()))
            .unwrap()
            .unwrap();
        assert_eq!(stored, lease);
    }

    #[test]
    fn test_rollback_restores_slot() {
        let f = fixture(2, "exit 0\n");
        let supervisor = f.supervisor();
        let lease = supervisor.allocate("alice").unwrap();
        let provisioned = supervisor.provision(&lease, &f.request()).unwrap();
        assert_eq!(f.scratch_entries(), 1);

        supervisor.rollback(&lease, Some(&provisioned)).unwrap();
        assert_eq!(f.counts(), (2, 0));
        assert_eq!(f.scratch_entries(), 0);

        // Rolling back twice is harmless
        supervisor.rollback(&lease, None).unwrap();
        assert_eq!(f.counts(), (2, 0));

        // The same slot comes out first again
        assert_eq!(supervisor.allocate("bob").unwrap().id, lease.id);
    }

    #[test]
    fn test_failed_provision_rolls_back() {
        let f = fixture(1, "exit 0\n");
        let mut request = f.request();
        request.scratch_disks = vec!["1G".to_string()];
        let mut config = f.config.clone();
        config.tools.disk_allocator = "false".to_string();
        let supervisor = Supervisor::new(f.store.clone(), config);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = runtime
            .block_on(supervisor.start("alice", &request))
            .unwrap_err();

        assert!(matches!(err, Error::Provisioning { .. }));
        assert_eq!(f.counts(), (1, 0));
        assert_eq!(f.scratch_entries(), 0);
    }

    #[test]
    fn test_scratch_recorded_before_spawn() {
        let f = fixture(2, "exit 0\n");
        let supervisor = f.supervisor();
        let lease = supervisor.allocate("alice").unwrap();
        let provisioned = supervisor.provision(&lease, &f.request()).unwrap();
        supervisor.record_scratch(&lease, &provisioned).unwrap();

        let stored = f
            .store
            .read(|pool| Ok(pool.find_running(lease.id).cloned()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SlotState::Setup);
        assert_eq!(stored.tmpdir.as_deref(), Some(provisioned.tmpdir.as_path()));
        assert_eq!(stored.pid, None);

        // The supervisor dies here; a later stop still cleans up
        let reclaimed = Reclaimer::new(f.store.clone()).reclaim(lease.id).unwrap();
        assert_eq!(reclaimed.record.tmpdir, Some(provisioned.tmpdir.clone()));
        assert!(!provisioned.tmpdir.exists());
        assert_eq!(f.counts(), (2, 0));

        // The reclaimed lease can no longer be updated
        assert!(supervisor.record_scratch(&lease, &provisioned).is_err());
    }

    #[test]
    fn test_commit_after_reclaim_fails() {
        let f = fixture(1, "exit 0\n");
        let supervisor = f.supervisor();
        let lease = supervisor.allocate("alice").unwrap();
        let provisioned = supervisor.provision(&lease, &f.request()).unwrap();

        // Someone reclaimed the setup lease in the meantime
        Reclaimer::new(f.store.clone()).reclaim(lease.id).unwrap();

        let err = supervisor
            .commit(&lease, &f.request(), &provisioned, 12345)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(f.counts(), (1, 0));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let f = fixture(8, "exit 0\n");

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let supervisor = Supervisor::new(
                    PoolStore::new(&f.config.paths()),
                    f.config.clone(),
                );
                std::thread::spawn(move || supervisor.allocate(&format!("user{}", i)))
            })
            .collect();

        let mut ids = BTreeSet::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(lease) => assert!(ids.insert(lease.id), "slot {} leased twice", lease.id),
                Err(Error::NoFreeSlots) => exhausted += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(ids, (0..8).collect::<BTreeSet<u32>>());
        assert_eq!(exhausted, 4);
        assert_eq!(f.counts(), (0, 8));
    }

    #[tokio::test]
    async fn test_start_supervise_release() {
        let _turn = supervise_turn();
        let f = fixture(2, "exit 3\n");
        let supervisor = f.supervisor();
        let request = f.request();

        let mut vm = supervisor.start("alice", &request).await.unwrap();
        assert_eq!(vm.record.state, SlotState::Running);
        assert!(vm.record.pid.is_some());
        assert!(vm.record.started_at.is_some());
        assert_eq!(vm.record.image.as_deref(), Some(f.image.as_path()));
        let tmpdir = vm.record.tmpdir.clone().unwrap();
        assert!(tmpdir.starts_with(f.scratch.path()));
        assert_eq!(f.counts(), (1, 1));

        let reason = supervisor.supervise(&mut vm).await;
        assert_eq!(reason, ExitReason::Exited(3));

        let released = supervisor.release(&vm).unwrap().unwrap();
        assert_eq!(released.record.id, vm.record.id);
        assert!(!tmpdir.exists());
        assert_eq!(f.counts(), (2, 0));

        // A second release finds nothing to do
        assert!(supervisor.release(&vm).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signal_stops_hypervisor_and_releases() {
        let _turn = supervise_turn();
        let f = fixture(2, "exec sleep 30\n");
        let supervisor = f.supervisor();

        let mut vm = supervisor.start("alice", &f.request()).await.unwrap();
        let tmpdir = vm.record.tmpdir.clone().unwrap();
        assert_eq!(f.counts(), (1, 1));

        let raise = async {
            // supervise installs its handlers on first poll
            tokio::time::sleep(Duration::from_millis(200)).await;
            unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
        };
        let (reason, ()) = tokio::join!(supervisor.supervise(&mut vm), raise);

        assert_eq!(reason, ExitReason::Interrupted("SIGTERM"));
        assert!(vm.child.try_wait().unwrap().is_some());
        assert!(!vm.record.is_process_alive());

        let released = supervisor.release(&vm).unwrap().unwrap();
        assert_eq!(released.record.id, vm.record.id);
        assert!(!tmpdir.exists());
        assert_eq!(f.counts(), (2, 0));
    }

    #[tokio::test]
    async fn test_stop_child_kills_stubborn_hypervisor() {
        let f = fixture(1, "trap '' TERM\nsleep 30\nexit 0\n");
        let supervisor = f.supervisor();

        let mut vm = supervisor.start("alice", &f.request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        supervisor.stop_child(&mut vm.child).await;
        assert!(started.elapsed() >= TEST_STOP_TIMEOUT);
        assert!(vm.child.try_wait().unwrap().is_some());

        supervisor.release(&vm).unwrap();
        assert_eq!(f.counts(), (1, 0));
    }
}

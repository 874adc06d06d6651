//! VM slot records.
//!
//! A [`VmRecord`] is one pre-generated slot identity (id, IP, MAC) plus the
//! runtime state of whichever VM currently holds it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Slot lifecycle state.
///
/// `Free -> Setup -> Running -> Stopped -> Free`. `Stopped` is transient: a
/// stopped record is folded back into the free collection in the same
/// transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Unowned, available for allocation.
    #[default]
    Free,
    /// Leased to an owner, scratch resources being provisioned.
    Setup,
    /// Hypervisor process spawned.
    Running,
    /// Hypervisor gone, runtime fields cleared.
    Stopped,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Free => write!(f, "free"),
            SlotState::Setup => write!(f, "setup"),
            SlotState::Running => write!(f, "running"),
            SlotState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Guest networking mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// User-mode networking with the guest SSH port forwarded to the host.
    User,
    /// Bridged onto a VDE virtual switch with the slot's MAC.
    Vde,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::User => write!(f, "user"),
            NetworkMode::Vde => write!(f, "vde"),
        }
    }
}

/// One slot of the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    /// Slot id, assigned at pool generation.
    pub id: u32,

    /// Fixed guest IP.
    pub ip: String,

    /// Fixed guest MAC.
    pub mac: String,

    /// Display name.
    pub name: String,

    /// Lifecycle state.
    #[serde(default)]
    pub state: SlotState,

    /// User holding the lease.
    #[serde(default)]
    pub owner: Option<String>,

    /// Hypervisor process ID.
    #[serde(default)]
    pub pid: Option<i32>,

    /// PID of the vmpool invocation that took the lease.
    #[serde(default)]
    pub supervisor_pid: Option<i32>,

    /// Per-VM scratch directory.
    #[serde(default)]
    pub tmpdir: Option<PathBuf>,

    /// Networking mode the hypervisor was started with.
    #[serde(default)]
    pub network_mode: Option<NetworkMode>,

    /// Base image the VM booted from.
    #[serde(default)]
    pub image: Option<PathBuf>,

    /// Kernel the VM booted with.
    #[serde(default)]
    pub kernel: Option<PathBuf>,

    /// Spawn timestamp.
    #[serde(default)]
    pub started_at: Option<String>,
}

impl VmRecord {
    /// Create a free slot record.
    pub fn new(id: u32, ip: String, mac: String, name: String) -> Self {
        Self {
            id,
            ip,
            mac,
            name,
            state: SlotState::Free,
            owner: None,
            pid: None,
            supervisor_pid: None,
            tmpdir: None,
            network_mode: None,
            image: None,
            kernel: None,
            started_at: None,
        }
    }

    /// Clear every runtime field, leaving only the slot identity.
    pub fn release(&mut self) {
        self.state = SlotState::Stopped;
        self.owner = None;
        self.pid = None;
        self.supervisor_pid = None;
        self.tmpdir = None;
        self.network_mode = None;
        self.image = None;
        self.kernel = None;
        self.started_at = None;
    }

    /// Check if the hypervisor process is still alive.
    ///
    /// Matches both the pid and the scratch directory, so a recycled pid
    /// reports not-alive.
    pub fn is_process_alive(&self) -> bool {
        match (self.pid, &self.tmpdir) {
            (Some(pid), Some(tmpdir)) => crate::process::is_vm_alive(pid, tmpdir),
            _ => false,
        }
    }

    /// Check if the invocation that leased this slot is still alive.
    pub fn is_supervisor_alive(&self) -> bool {
        self.supervisor_pid.is_some_and(crate::process::is_alive)
    }

    /// Whether this record belongs to the lease described by `lease`.
    ///
    /// A slot that was reclaimed and leased again keeps its id but gets a
    /// new scratch directory and supervisor.
    pub fn same_lease(&self, lease: &VmRecord) -> bool {
        self.id == lease.id
            && self.tmpdir == lease.tmpdir
            && self.supervisor_pid == lease.supervisor_pid
    }
}

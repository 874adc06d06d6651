//! Global vmpool configuration.
//!
//! The configuration is a TOML file, read once per invocation. Every field
//! has a default, so a missing file (or a partial one) is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory holding the pool store, lock file and DHCP entries.
pub const DEFAULT_STATE_DIR: &str = "/etc/vms";

/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV: &str = "VMPOOL_CONFIG";

/// Configuration file name inside the default state directory.
const CONFIG_FILENAME: &str = "vmpool.toml";

/// Lock file guarding every pool store transaction.
pub const LOCK_FILENAME: &str = "ips.lock";

/// Pool store database.
pub const STORE_FILENAME: &str = "ips.redb";

/// Generated DHCP host entries.
pub const DHCP_FILENAME: &str = "vm.dhcp";

/// SSH key looked up next to the executable when none is configured.
const SSH_KEY_FILENAME: &str = "id_dsa";

/// Global vmpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the pool store and lock file.
    pub state_dir: PathBuf,

    /// Upper bound on the number of slots `genips` may generate.
    pub max_vms: u32,

    /// Memory size handed to the hypervisor when `start` gets no `-m`.
    pub default_memory: String,

    /// Base directory for per-VM scratch directories.
    pub scratch_base: PathBuf,

    /// How long `stop` waits for a VM to exit after SIGTERM (e.g. "10s").
    pub stop_timeout: String,

    /// Slot identity and guest networking settings.
    pub network: NetworkConfig,

    /// External tool binaries.
    pub tools: ToolConfig,

    /// Private key used by `vmpool ssh`.
    pub ssh_key: Option<PathBuf>,

    /// Display name overrides, keyed by slot id.
    pub names: BTreeMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            max_vms: 100,
            default_memory: "1G".to_string(),
            scratch_base: PathBuf::from("/tmp"),
            stop_timeout: "10s".to_string(),
            network: NetworkConfig::default(),
            tools: ToolConfig::default(),
            ssh_key: None,
            names: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from `$VMPOOL_CONFIG` or the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(DEFAULT_STATE_DIR).join(CONFIG_FILENAME));
        Self::load_from(&path)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let config: PoolConfig = toml::from_str(&text)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.max_vms == 0 {
            return Err(Error::config("validate config", "max_vms must be at least 1"));
        }
        if self.default_memory.trim().is_empty() {
            return Err(Error::config("validate config", "default_memory is empty"));
        }
        self.stop_timeout()?;
        Ok(())
    }

    /// Paths of the shared pool files.
    pub fn paths(&self) -> PoolPaths {
        PoolPaths::new(&self.state_dir)
    }

    /// Parsed stop timeout.
    pub fn stop_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.stop_timeout).map_err(|e| {
            Error::config(
                "parse stop_timeout",
                format!("'{}': {}", self.stop_timeout, e),
            )
        })
    }

    /// Display name for a slot: the configured override, else `vm{id:02}`.
    pub fn slot_name(&self, id: u32) -> String {
        self.names
            .get(&id.to_string())
            .cloned()
            .unwrap_or_else(|| format!("vm{:02}", id))
    }

    /// Resolve the SSH key used for `vmpool ssh`.
    ///
    /// Searches in order:
    /// 1. The configured `ssh_key`
    /// 2. `~/.vmpool/id_dsa`
    /// 3. Next to the current executable
    pub fn ssh_key_path(&self) -> Option<PathBuf> {
        if let Some(key) = &self.ssh_key {
            return Some(key.clone());
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".vmpool").join(SSH_KEY_FILENAME);
            if path.exists() {
                return Some(path);
            }
        }

        let exe_path = std::env::current_exe().ok()?;
        let path = exe_path.parent()?.join(SSH_KEY_FILENAME);
        path.exists().then_some(path)
    }
}

/// Slot identity and guest networking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Prefix of every slot IP, including the trailing dot.
    pub subnet_prefix: String,

    /// Last IP octet of slot 0.
    pub ip_offset: u32,

    /// First five MAC bytes; the slot id is the sixth.
    pub mac_prefix: String,

    /// Host port forwarded to guest port 22 for slot 0 in user networking.
    pub ssh_port_base: u16,

    /// VDE switch control socket.
    pub vde_socket: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet_prefix: "172.20.0.".to_string(),
            ip_offset: 100,
            mac_prefix: "DE:AD:BE:EF:01".to_string(),
            ssh_port_base: 9000,
            vde_socket: PathBuf::from("/tmp/vde.ctl"),
        }
    }
}

impl NetworkConfig {
    /// Fixed IP of a slot.
    pub fn ip_for(&self, id: u32) -> String {
        format!("{}{}", self.subnet_prefix, self.ip_offset + id)
    }

    /// Fixed MAC of a slot.
    pub fn mac_for(&self, id: u32) -> String {
        format!("{}:{:02X}", self.mac_prefix, id)
    }

    /// Host port forwarded to the guest's SSH port.
    pub fn ssh_port(&self, id: u32) -> u16 {
        let id = u16::try_from(id).unwrap_or(u16::MAX);
        self.ssh_port_base.saturating_add(id)
    }

    /// Largest slot count these settings can address.
    pub fn max_slots(&self) -> u32 {
        let by_ip = 255u32.saturating_sub(self.ip_offset);
        let by_mac = 256;
        let by_port = u32::from(u16::MAX - self.ssh_port_base) + 1;
        by_ip.min(by_mac).min(by_port)
    }
}

/// External tool commands, resolved through `PATH` unless absolute.
///
/// A tool may carry leading arguments separated by whitespace, e.g.
/// `iso_builder = "xorriso -as mkisofs"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Hypervisor binary.
    pub hypervisor: String,
    /// ISO image builder (directory -> ISO).
    pub iso_builder: String,
    /// Scratch disk allocator (size -> file).
    pub disk_allocator: String,
    /// SSH client.
    pub ssh: String,
    /// Debugger.
    pub gdb: String,
    /// Serial terminal used to attach to the monitor socket.
    pub minicom: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            hypervisor: "qemu-system-x86_64".to_string(),
            iso_builder: "genisoimage".to_string(),
            disk_allocator: "fallocate".to_string(),
            ssh: "ssh".to_string(),
            gdb: "gdb".to_string(),
            minicom: "minicom".to_string(),
        }
    }
}

/// Split a tool command into its program and leading arguments.
pub fn split_tool(tool: &str) -> Result<(&str, Vec<&str>)> {
    let mut words = tool.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| Error::config("resolve tool", "empty tool command"))?;
    Ok((program, words.collect()))
}

/// Locations of the shared pool files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPaths {
    /// Lock file.
    pub lock: PathBuf,
    /// Pool store database.
    pub store: PathBuf,
    /// DHCP host entries.
    pub dhcp: PathBuf,
}

impl PoolPaths {
    /// Pool file locations inside a state directory.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            lock: state_dir.join(LOCK_FILENAME),
            store: state_dir.join(STORE_FILENAME),
            dhcp: state_dir.join(DHCP_FILENAME),
        }
    }
}

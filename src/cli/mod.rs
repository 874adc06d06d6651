//! CLI command implementations.

pub mod gdb;
pub mod genips;
pub mod list;
pub mod mon;
pub mod ssh;
pub mod start;
pub mod stop;

use std::os::unix::process::CommandExt;
use std::process::Command;
use vmpool::config::PoolConfig;
use vmpool::record::{SlotState, VmRecord};
use vmpool::store::PoolStore;
use vmpool::Error;

/// Store handle for commands that need an existing pool.
pub fn open_store(config: &PoolConfig) -> vmpool::Result<PoolStore> {
    let store = PoolStore::from_config(config);
    if !store.is_initialized() {
        return Err(Error::PoolNotInitialized(config.state_dir.clone()));
    }
    Ok(store)
}

/// Look up a running VM by slot id.
///
/// Slots still being set up have no hypervisor to attach to yet.
pub fn running_vm(config: &PoolConfig, id: u32) -> vmpool::Result<VmRecord> {
    let record = open_store(config)?.read(|pool| {
        pool.find_running(id)
            .cloned()
            .ok_or(Error::NotRunning(id))
    })?;

    if record.state != SlotState::Running {
        return Err(Error::InvalidState {
            id,
            expected: SlotState::Running.to_string(),
            actual: record.state.to_string(),
        });
    }
    Ok(record)
}

/// Replace this process with `command`. Only returns on failure.
pub fn exec(mut command: Command) -> vmpool::Result<()> {
    tracing::debug!(?command, "exec");
    let err = command.exec();
    Err(Error::Spawn(format!(
        "{}: {}",
        command.get_program().to_string_lossy(),
        err
    )))
}

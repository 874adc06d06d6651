//! Mon command implementation.

use clap::Args;
use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use vmpool::config::{split_tool, PoolConfig};
use vmpool::hypervisor::MONITOR_SOCKET;

/// Attach to a running VM's hypervisor monitor.
#[derive(Args, Debug)]
pub struct MonCmd {
    /// Slot id of the VM.
    pub id: u32,
}

impl MonCmd {
    /// Execute the mon command. Does not return on success.
    pub fn run(&self, config: &PoolConfig) -> vmpool::Result<()> {
        let record = super::running_vm(config, self.id)?;
        let tmpdir = record.tmpdir.ok_or(vmpool::Error::NotRunning(self.id))?;

        let (program, leading) = split_tool(&config.tools.minicom)?;
        let mut command = Command::new(program);
        command.args(leading).args(mon_args(&tmpdir));
        super::exec(command)
    }
}

fn mon_args(tmpdir: &Path) -> Vec<OsString> {
    let mut device = OsString::from("unix#");
    device.push(tmpdir.join(MONITOR_SOCKET));
    vec!["-D".into(), device]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mon_args() {
        let args = mon_args(Path::new("/tmp/vm2-alice-xyz"));
        assert_eq!(args, [OsString::from("-D"), OsString::from("unix#/tmp/vm2-alice-xyz/mon")]);
    }
}

//! Gdb command implementation.

use clap::Args;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use vmpool::config::{split_tool, PoolConfig};
use vmpool::hypervisor::GDB_SOCKET;

/// Attach gdb to a running VM's kernel debugger serial port.
#[derive(Args, Debug)]
pub struct GdbCmd {
    /// Slot id of the VM.
    pub id: u32,

    /// Symbol file (e.g. vmlinux).
    pub symbols: PathBuf,
}

impl GdbCmd {
    /// Execute the gdb command. Does not return on success.
    pub fn run(&self, config: &PoolConfig) -> vmpool::Result<()> {
        let record = super::running_vm(config, self.id)?;
        let tmpdir = record.tmpdir.ok_or(vmpool::Error::NotRunning(self.id))?;

        let (program, leading) = split_tool(&config.tools.gdb)?;
        let mut command = Command::new(program);
        command.args(leading).args(gdb_args(&tmpdir, &self.symbols));
        super::exec(command)
    }
}

fn gdb_args(tmpdir: &Path, symbols: &Path) -> Vec<OsString> {
    let mut target = OsString::from("target remote | socat UNIX-CONNECT:");
    target.push(tmpdir.join(GDB_SOCKET));
    target.push(" -");

    vec![
        "-ex".into(),
        "set remote interrupt-on-connect".into(),
        "-ex".into(),
        target,
        symbols.as_os_str().to_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdb_args() {
        let args: Vec<String> = gdb_args(Path::new("/tmp/vm2-alice-xyz"), Path::new("vmlinux"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-ex",
                "set remote interrupt-on-connect",
                "-ex",
                "target remote | socat UNIX-CONNECT:/tmp/vm2-alice-xyz/gdb -",
                "vmlinux"
            ]
        );
    }
}

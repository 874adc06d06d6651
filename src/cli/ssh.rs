//! SSH command implementation.

use clap::Args;
use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use vmpool::config::{split_tool, PoolConfig};
use vmpool::record::{NetworkMode, VmRecord};

/// SSH into a running VM.
#[derive(Args, Debug)]
pub struct SshCmd {
    /// Slot id of the VM.
    pub id: u32,
}

impl SshCmd {
    /// Execute the ssh command. Does not return on success.
    pub fn run(&self, config: &PoolConfig) -> vmpool::Result<()> {
        let record = super::running_vm(config, self.id)?;
        let key = config.ssh_key_path();
        if key.is_none() {
            tracing::debug!("no ssh key found, using ssh defaults");
        }

        let (program, leading) = split_tool(&config.tools.ssh)?;
        let mut command = Command::new(program);
        command
            .args(leading)
            .args(ssh_args(&record, key.as_deref(), config));
        super::exec(command)
    }
}

/// Arguments for reaching a VM over SSH.
///
/// User networking forwards a per-slot localhost port to the guest. VDE
/// guests are reached directly on their fixed IP.
fn ssh_args(record: &VmRecord, key: Option<&Path>, config: &PoolConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    let vde = record.network_mode == Some(NetworkMode::Vde);
    if vde {
        args.extend(
            ["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]
                .map(OsString::from),
        );
    } else {
        args.extend(["-o", "NoHostAuthenticationForLocalhost=yes"].map(OsString::from));
    }

    if let Some(key) = key {
        args.push("-i".into());
        args.push(key.as_os_str().to_owned());
    }

    if vde {
        args.push(format!("root@{}", record.ip).into());
    } else {
        args.push("-p".into());
        args.push(config.network.ssh_port(record.id).to_string().into());
        args.push("root@localhost".into());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vmpool::record::SlotState;

    fn running(network: NetworkMode) -> VmRecord {
        let mut record = VmRecord::new(
            7,
            "172.20.0.107".to_string(),
            "DE:AD:BE:EF:01:07".to_string(),
            "vm07".to_string(),
        );
        record.state = SlotState::Running;
        record.network_mode = Some(network);
        record
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_user_networking_args() {
        let key = PathBuf::from("/keys/id_dsa");
        let args = ssh_args(&running(NetworkMode::User), Some(&key), &PoolConfig::default());
        assert_eq!(
            strings(args),
            [
                "-o",
                "NoHostAuthenticationForLocalhost=yes",
                "-i",
                "/keys/id_dsa",
                "-p",
                "9007",
                "root@localhost"
            ]
        );
    }

    #[test]
    fn test_vde_args() {
        let key = PathBuf::from("/keys/id_dsa");
        let args = ssh_args(&running(NetworkMode::Vde), Some(&key), &PoolConfig::default());
        assert_eq!(
            strings(args),
            [
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-i",
                "/keys/id_dsa",
                "root@172.20.0.107"
            ]
        );
    }

    #[test]
    fn test_without_key() {
        let args = strings(ssh_args(&running(NetworkMode::User), None, &PoolConfig::default()));
        assert!(!args.contains(&"-i".to_string()));
    }
}

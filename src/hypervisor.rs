//! Hypervisor command line and process spawning.

use crate::config::{split_tool, NetworkConfig, ToolConfig};
use crate::error::{Error, Result};
use crate::provision::Provisioned;
use crate::record::{NetworkMode, VmRecord};
use crate::request::VmRequest;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use tokio::process::{Child, Command};

/// Pid file written by the hypervisor.
pub const PIDFILE: &str = "pid";

/// Console socket.
pub const CONSOLE_SOCKET: &str = "con";

/// Serial port the guest kernel debugger listens on.
pub const GDB_SOCKET: &str = "gdb";

/// Hypervisor monitor socket.
pub const MONITOR_SOCKET: &str = "mon";

/// Kernel command line used when booting a kernel directly.
pub const KERNEL_CMDLINE: &str = "root=/dev/sda rw console=ttyS0,115200 kgdboc=ttyS2,115200";

/// Guest SSH port.
pub const GUEST_SSH_PORT: u16 = 22;

fn concat(parts: &[&OsStr]) -> OsString {
    let mut out = OsString::new();
    for part in parts {
        out.push(part);
    }
    out
}

fn unix_socket(tmpdir: &Path, name: &str) -> OsString {
    concat(&[
        OsStr::new("unix:"),
        tmpdir.join(name).as_os_str(),
        OsStr::new(",server,nowait"),
    ])
}

fn push(args: &mut Vec<OsString>, flag: &str, value: OsString) {
    args.push(flag.into());
    args.push(value);
}

/// Build the hypervisor arguments for a provisioned VM.
///
/// The scratch directory appears on the command line (pid file, sockets),
/// which is what lets the liveness check tell this process apart from an
/// unrelated one that inherited its pid.
pub fn hypervisor_args(
    lease: &VmRecord,
    request: &VmRequest,
    provisioned: &Provisioned,
    network: &NetworkConfig,
) -> Vec<OsString> {
    let tmpdir = provisioned.tmpdir.as_path();
    let mut args: Vec<OsString> = Vec::new();

    push(&mut args, "-machine", "accel=kvm".into());
    push(&mut args, "-pidfile", tmpdir.join(PIDFILE).into_os_string());
    push(&mut args, "-m", request.memory.clone().into());

    if let Some(kernel) = &request.kernel {
        push(&mut args, "-kernel", kernel.clone().into_os_string());
        push(&mut args, "-append", KERNEL_CMDLINE.into());
    }

    args.push("-nographic".into());
    args.push("-s".into());
    push(&mut args, "-serial", "stdio".into());
    push(
        &mut args,
        "-serial",
        concat(&[
            OsStr::new("mon:"),
            unix_socket(tmpdir, CONSOLE_SOCKET).as_os_str(),
        ]),
    );
    push(&mut args, "-serial", unix_socket(tmpdir, GDB_SOCKET));
    push(&mut args, "-monitor", unix_socket(tmpdir, MONITOR_SOCKET));

    let drive = if request.persistent {
        "format=raw,file="
    } else {
        "format=raw,snapshot=on,file="
    };
    push(
        &mut args,
        "-drive",
        concat(&[OsStr::new(drive), request.image.as_os_str()]),
    );

    for disk in &provisioned.disks {
        push(
            &mut args,
            "-drive",
            concat(&[
                OsStr::new("if=virtio,format=raw,cache=writeback,file="),
                disk.as_os_str(),
            ]),
        );
    }

    if let Some(iso) = &provisioned.iso {
        push(&mut args, "-cdrom", iso.clone().into_os_string());
    }

    match request.network {
        NetworkMode::Vde => {
            push(
                &mut args,
                "-netdev",
                concat(&[
                    OsStr::new("vde,id=vde_net,sock="),
                    network.vde_socket.as_os_str(),
                ]),
            );
            push(
                &mut args,
                "-device",
                format!("virtio-net-pci,netdev=vde_net,mac={}", lease.mac).into(),
            );
        }
        NetworkMode::User => {
            push(&mut args, "-net", "nic,model=virtio".into());
            push(
                &mut args,
                "-net",
                format!(
                    "user,hostfwd=tcp:127.0.0.1:{}-:{}",
                    network.ssh_port(lease.id),
                    GUEST_SSH_PORT
                )
                .into(),
            );
        }
    }

    args
}

/// Read the pid the hypervisor wrote into its scratch directory.
///
/// Returns `None` if the hypervisor never got that far.
pub fn read_pidfile(tmpdir: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(tmpdir.join(PIDFILE)).ok()?;
    contents.trim().parse().ok().filter(|pid| *pid > 0)
}

/// Spawn the hypervisor. Must be called from within a tokio runtime.
pub fn spawn(tools: &ToolConfig, args: &[OsString]) -> Result<Child> {
    let (program, leading) = split_tool(&tools.hypervisor)?;

    tracing::debug!(program, ?args, "spawning hypervisor");
    let child = Command::new(program)
        .args(leading)
        .args(args)
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", program, e)))?;

    if child.id().is_none() {
        return Err(Error::Spawn(format!("{} exited immediately", program)));
    }

    Ok(child)
}

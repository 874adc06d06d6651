//! Per-VM scratch resources.
//!
//! Each leased slot gets a private scratch directory holding the hypervisor
//! sockets, the pid file, the generated cdrom image and the scratch disks.
//! Provisioning is all-or-nothing: on failure the directory is removed and
//! nothing outside it is left behind.

use crate::config::{split_tool, ToolConfig};
use crate::error::{Error, ProvisionStep, Result};
use crate::record::VmRecord;
use crate::request::VmRequest;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Name of the cdrom image built from a directory.
pub const ISO_FILENAME: &str = "run.iso";

/// Random characters in a scratch directory name.
const SCRATCH_RAND_LEN: usize = 12;

/// Resources created for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// Scratch directory, owned by the VM until it is reclaimed.
    pub tmpdir: PathBuf,
    /// Cdrom image to attach, if any.
    pub iso: Option<PathBuf>,
    /// Scratch disks, in request order.
    pub disks: Vec<PathBuf>,
}

/// Create the scratch directory and everything in it for `lease`.
pub fn provision(lease: &VmRecord, request: &VmRequest, tools: &ToolConfig) -> Result<Provisioned> {
    let id = lease.id;
    let owner = lease.owner.as_deref().unwrap_or("unknown").replace('/', "_");

    let dir = tempfile::Builder::new()
        .prefix(&format!("vm{}-{}-", id, owner))
        .rand_bytes(SCRATCH_RAND_LEN)
        .tempdir_in(&request.scratch_base)
        .map_err(|e| {
            Error::provisioning(
                id,
                ProvisionStep::ScratchDir,
                format!("{}: {}", request.scratch_base.display(), e),
            )
        })?;

    // `dir` is removed on every early return below.
    let iso = match &request.cdrom {
        None => None,
        Some(source) if source.is_dir() => {
            let iso = dir.path().join(ISO_FILENAME);
            build_iso(tools, source, &iso)
                .map_err(|e| Error::provisioning(id, ProvisionStep::Iso, e))?;
            Some(iso)
        }
        Some(source) => Some(source.clone()),
    };

    let mut disks = Vec::with_capacity(request.scratch_disks.len());
    for (n, size) in request.scratch_disks.iter().enumerate() {
        let disk = dir.path().join(format!("disk-{}", n + 1));
        allocate_disk(tools, size, &disk)
            .map_err(|e| Error::provisioning(id, ProvisionStep::ScratchDisk, e))?;
        disks.push(disk);
    }

    if let Some(index) = &request.index_file {
        std::fs::write(index, id.to_string()).map_err(|e| {
            Error::provisioning(
                id,
                ProvisionStep::IndexFile,
                format!("{}: {}", index.display(), e),
            )
        })?;
    }

    let tmpdir = dir.keep();
    tracing::info!(id, tmpdir = %tmpdir.display(), disks = disks.len(), "provisioned scratch resources");

    Ok(Provisioned { tmpdir, iso, disks })
}

/// Remove a scratch directory. A directory that is already gone is fine.
pub fn remove_scratch(tmpdir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(tmpdir) {
        Ok(()) => {
            tracing::debug!(tmpdir = %tmpdir.display(), "removed scratch directory");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn build_iso(tools: &ToolConfig, source: &Path, iso: &Path) -> std::result::Result<(), String> {
    run_tool(
        &tools.iso_builder,
        &[
            OsStr::new("-quiet"),
            OsStr::new("-R"),
            OsStr::new("-input-charset"),
            OsStr::new("utf-8"),
            OsStr::new("-o"),
            iso.as_os_str(),
            source.as_os_str(),
        ],
    )
}

fn allocate_disk(tools: &ToolConfig, size: &str, disk: &Path) -> std::result::Result<(), String> {
    run_tool(
        &tools.disk_allocator,
        &[OsStr::new("-l"), OsStr::new(size), disk.as_os_str()],
    )
}

fn run_tool(tool: &str, args: &[&OsStr]) -> std::result::Result<(), String> {
    let (program, leading) = split_tool(tool).map_err(|e| e.to_string())?;

    tracing::debug!(program, ?args, "running tool");
    let output = Command::new(program)
        .args(leading)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        ));
    }

    Ok(())
}

//! VM start requests.

use crate::error::{Error, Result};
use crate::record::NetworkMode;
use std::path::PathBuf;

/// Size suffixes accepted for memory and scratch disk sizes.
const SIZE_SUFFIXES: &[&str] = &[
    "", "K", "M", "G", "T", "KB", "MB", "GB", "TB", "KiB", "MiB", "GiB", "TiB",
];

/// Everything needed to provision and boot one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    /// Base disk image.
    pub image: PathBuf,
    /// Kernel to boot directly instead of the image's bootloader.
    pub kernel: Option<PathBuf>,
    /// ISO file, or a directory to turn into one.
    pub cdrom: Option<PathBuf>,
    /// Scratch disk sizes (e.g. "256M", "2G").
    pub scratch_disks: Vec<String>,
    /// Directory the per-VM scratch directory is created in.
    pub scratch_base: PathBuf,
    /// Guest memory (e.g. "1G").
    pub memory: String,
    /// Write through to the base image instead of a snapshot.
    pub persistent: bool,
    /// File to write the allocated slot id to.
    pub index_file: Option<PathBuf>,
    /// Guest networking mode.
    pub network: NetworkMode,
}

impl VmRequest {
    /// Create a request with defaults for everything but the image.
    pub fn new(image: impl Into<PathBuf>, scratch_base: impl Into<PathBuf>, memory: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            kernel: None,
            cdrom: None,
            scratch_disks: Vec::new(),
            scratch_base: scratch_base.into(),
            memory: memory.into(),
            persistent: false,
            index_file: None,
            network: NetworkMode::User,
        }
    }

    /// Check the request before any slot is allocated.
    pub fn validate(&self) -> Result<()> {
        if !self.image.is_file() {
            return Err(Error::config(
                "find base image",
                format!("cannot find base image file: {}", self.image.display()),
            ));
        }

        if let Some(kernel) = &self.kernel {
            if !kernel.is_file() {
                return Err(Error::config(
                    "find kernel",
                    format!("cannot find kernel file: {}", kernel.display()),
                ));
            }
        }

        if let Some(cdrom) = &self.cdrom {
            if !cdrom.exists() {
                return Err(Error::config(
                    "find cdrom source",
                    format!("cannot find cdrom source: {}", cdrom.display()),
                ));
            }
        }

        if !self.scratch_base.is_dir() {
            return Err(Error::config(
                "find scratch directory base",
                format!("not a directory: {}", self.scratch_base.display()),
            ));
        }

        validate_size(&self.memory, "memory size")?;
        for size in &self.scratch_disks {
            validate_size(size, "scratch disk size")?;
        }

        Ok(())
    }
}

/// Check a size such as "512", "256M" or "2GiB".
pub fn validate_size(size: &str, kind: &str) -> Result<()> {
    let digits = size.chars().take_while(|c| c.is_ascii_digit()).count();
    let (number, suffix) = size.split_at(digits);

    let valid = !number.is_empty()
        && number.parse::<u64>().is_ok_and(|n| n > 0)
        && SIZE_SUFFIXES.contains(&suffix);

    if valid {
        Ok(())
    } else {
        Err(Error::config(
            format!("parse {}", kind),
            format!("invalid size '{}' (expected e.g. 256M or 2G)", size),
        ))
    }
}

//! Start command implementation.

use clap::Args;
use std::path::PathBuf;
use vmpool::config::PoolConfig;
use vmpool::reclaim::Termination;
use vmpool::record::NetworkMode;
use vmpool::request::VmRequest;
use vmpool::supervisor::Supervisor;
use vmpool::util;

const GREEN: &str = "\x1b[32m";
const NC: &str = "\x1b[0m";

/// Lease a slot and run a VM until it exits.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Base disk image to boot.
    #[arg(short, long)]
    pub image: PathBuf,

    /// Kernel to boot directly.
    #[arg(short, long)]
    pub kernel: Option<PathBuf>,

    /// ISO file, or a directory to build one from.
    #[arg(short = 'c', long = "cdrom", value_name = "PATH")]
    pub cdrom: Option<PathBuf>,

    /// Scratch disk sizes, comma separated (e.g. 256M,2G).
    #[arg(short = 's', long = "scratch", value_delimiter = ',', value_name = "SIZES")]
    pub scratch: Vec<String>,

    /// Directory to create the scratch directory in.
    #[arg(short = 't', long = "tmpdir", value_name = "DIR")]
    pub tmpdir: Option<PathBuf>,

    /// Guest memory (default from config).
    #[arg(short, long)]
    pub memory: Option<String>,

    /// Write changes through to the base image.
    #[arg(short, long)]
    pub persistent: bool,

    /// Write the allocated slot id to this file.
    #[arg(long = "id", value_name = "FILE")]
    pub index_file: Option<PathBuf>,

    /// Use VDE networking instead of user networking.
    #[arg(long)]
    pub vde: bool,
}

impl StartCmd {
    fn request(&self, config: &PoolConfig) -> VmRequest {
        VmRequest {
            image: self.image.clone(),
            kernel: self.kernel.clone(),
            cdrom: self.cdrom.clone(),
            scratch_disks: self.scratch.clone(),
            scratch_base: self
                .tmpdir
                .clone()
                .unwrap_or_else(|| config.scratch_base.clone()),
            memory: self
                .memory
                .clone()
                .unwrap_or_else(|| config.default_memory.clone()),
            persistent: self.persistent,
            index_file: self.index_file.clone(),
            network: if self.vde {
                NetworkMode::Vde
            } else {
                NetworkMode::User
            },
        }
    }

    /// Execute the start command.
    pub fn run(self, config: &PoolConfig) -> vmpool::Result<()> {
        let request = self.request(config);
        request.validate()?;

        let store = super::open_store(config)?;
        let supervisor = Supervisor::new(store, config.clone());
        let owner = util::current_user();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async {
            let mut vm = supervisor.start(&owner, &request).await?;
            println!(
                "{}Vm ID: {} IP: {} MAC: {}{}",
                GREEN, vm.record.id, vm.record.ip, vm.record.mac, NC
            );

            let reason = supervisor.supervise(&mut vm).await;
            tracing::info!(id = vm.record.id, %reason, "supervision ended");

            match supervisor.release(&vm)? {
                Some(released) => {
                    if released.termination == Termination::NeverStarted {
                        println!("Vm {} never started. Releasing domain", released.record.name);
                    } else {
                        println!("Vm {} terminated. Releasing domain", released.record.name);
                    }
                    if let Some(e) = released.cleanup_error {
                        eprintln!("Warning: failed to remove scratch directory: {}", e);
                    }
                }
                None => {
                    println!("Vm {} was already released", vm.record.name);
                }
            }
            Ok::<(), vmpool::Error>(())
        })
    }
}

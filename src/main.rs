//! vmpool CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vmpool::config::PoolConfig;

mod cli;

/// vmpool - shared VM slot pool for QEMU guests
#[derive(Parser, Debug)]
#[command(name = "vmpool")]
#[command(about = "Shared VM slot pool for QEMU guests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lease a slot and run a VM in the foreground until it exits.
    Start(cli::start::StartCmd),

    /// Stop a running VM and return its slot to the pool.
    Stop(cli::stop::StopCmd),

    /// List leased slots.
    #[command(alias = "ls")]
    List(cli::list::ListCmd),

    /// Regenerate the slot pool (destroys all pool state).
    Genips(cli::genips::GenipsCmd),

    /// SSH into a running VM.
    Ssh(cli::ssh::SshCmd),

    /// Attach gdb to a running VM's kernel debugger.
    Gdb(cli::gdb::GdbCmd),

    /// Attach to a running VM's hypervisor monitor.
    Mon(cli::mon::MonCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = vmpool::VERSION, "starting vmpool");

    // Load configuration
    let config = match PoolConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            PoolConfig::default()
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start(cmd) => cmd.run(&config),
        Commands::Stop(cmd) => cmd.run(&config),
        Commands::List(cmd) => cmd.run(&config),
        Commands::Genips(cmd) => cmd.run(&config),
        Commands::Ssh(cmd) => cmd.run(&config),
        Commands::Gdb(cmd) => cmd.run(&config),
        Commands::Mon(cmd) => cmd.run(&config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmpool=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

//! Stop command implementation.

use clap::Args;
use std::time::Duration;
use vmpool::config::PoolConfig;
use vmpool::reclaim::{Reclaimer, Termination};

/// Stop a running VM.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Slot id of the VM to stop.
    pub id: u32,

    /// Force stop (SIGKILL after timeout).
    #[arg(short, long)]
    pub force: bool,

    /// How long to wait after SIGTERM (e.g. 10s, 500ms).
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, config: &PoolConfig) -> vmpool::Result<()> {
        let store = super::open_store(config)?;
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => config.stop_timeout()?,
        };

        println!("Stopping vm {}", self.id);

        let reclaimed = Reclaimer::new(store)
            .timeout(timeout)
            .force(self.force)
            .reclaim(self.id)?;

        match reclaimed.termination {
            Termination::NeverStarted => {
                println!("Vm {} never started. Releasing domain", reclaimed.record.name)
            }
            _ => println!("Vm {} terminated. Releasing domain", reclaimed.record.name),
        }
        if let Some(e) = reclaimed.cleanup_error {
            eprintln!("Warning: failed to remove scratch directory: {}", e);
        }
        Ok(())
    }
}

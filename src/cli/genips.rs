//! Genips command implementation.

use clap::Args;
use vmpool::config::PoolConfig;
use vmpool::error::Error;
use vmpool::store::PoolStore;
use vmpool::{pool, util};

/// Regenerate the slot pool.
#[derive(Args, Debug)]
pub struct GenipsCmd {
    /// Number of slots to generate (default: max_vms from config).
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    pub yes: bool,

    /// Regenerate even while VMs are running.
    #[arg(short, long)]
    pub force: bool,
}

impl GenipsCmd {
    /// Execute the genips command.
    pub fn run(&self, config: &PoolConfig) -> vmpool::Result<()> {
        if !util::is_root() {
            return Err(Error::PermissionDenied(
                "genips must be run as root".to_string(),
            ));
        }

        let count = self.count.unwrap_or(config.max_vms);

        if !self.force {
            let live = live_vms(&PoolStore::from_config(config))?;
            if live > 0 {
                return Err(Error::config(
                    "regenerate pool",
                    format!("{} vm(s) still running (stop them or use --force)", live),
                ));
            }
        }

        // Confirm unless --yes
        if !self.yes {
            eprint!(
                "This will overwrite any current vm list files. Are you sure? (y): "
            );
            let mut input = String::new();
            if std::io::stdin().read_line(&mut input).is_err() || input.trim() != "y" {
                println!("Cancelled");
                return Ok(());
            }
        }

        let generated = pool::regenerate(config, count)?;
        tracing::info!(slots = generated.len(), "pool regenerated");

        println!("Setup completed");
        Ok(())
    }
}

/// Number of leased slots whose hypervisor or supervisor is still alive.
fn live_vms(store: &PoolStore) -> vmpool::Result<usize> {
    if !store.is_initialized() {
        return Ok(0);
    }
    store.read(|pool| {
        Ok(pool
            .running
            .iter()
            .filter(|r| r.is_process_alive() || r.is_supervisor_alive())
            .count())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmpool::record::SlotState;

    #[test]
    fn test_live_vms() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = PoolStore::from_config(&config);

        // Nothing to protect before the first generation
        assert_eq!(live_vms(&store).unwrap(), 0);

        pool::regenerate(&config, 3).unwrap();
        assert_eq!(live_vms(&store).unwrap(), 0);

        store
            .transaction(|pool| {
                let mut alive = pool.pop_free().unwrap();
                alive.state = SlotState::Setup;
                alive.supervisor_pid = Some(std::process::id() as i32);
                pool.running.push(alive);

                let mut dead = pool.pop_free().unwrap();
                dead.state = SlotState::Running;
                dead.pid = Some(999_999_999);
                dead.tmpdir = Some("/tmp/vmpool-test-gone".into());
                pool.running.push(dead);
                Ok(())
            })
            .unwrap();

        assert_eq!(live_vms(&store).unwrap(), 1);
    }
}

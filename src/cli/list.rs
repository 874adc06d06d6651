//! List command implementation.

use clap::Args;
use vmpool::config::PoolConfig;
use vmpool::record::{SlotState, VmRecord};
use vmpool::store::Pool;

/// List leased slots.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Include free slots.
    #[arg(short, long)]
    pub all: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, config: &PoolConfig) -> vmpool::Result<()> {
        let pool = super::open_store(config)?.read(|pool| Ok(pool.clone()))?;
        let rows = self.rows(&pool);

        if self.json {
            let json_vms: Vec<_> = rows
                .iter()
                .map(|(record, alive)| {
                    serde_json::json!({
                        "id": record.id,
                        "name": record.name,
                        "ip": record.ip,
                        "mac": record.mac,
                        "state": record.state.to_string(),
                        "owner": record.owner,
                        "pid": record.pid,
                        "alive": alive,
                        "tmpdir": record.tmpdir,
                        "network": record.network_mode.map(|m| m.to_string()),
                        "image": record.image,
                        "kernel": record.kernel,
                        "started_at": record.started_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json_vms)?);
            return Ok(());
        }

        if rows.is_empty() {
            println!("No VMs running");
            return Ok(());
        }

        println!(
            "{:<10} {:<15} {:<12} {:<8} {:<8} {:<5} {:<6}",
            "DOMAIN", "IP", "OWNER", "PID", "STATE", "DEAD", "NET"
        );
        println!("{}", "-".repeat(70));

        for (record, alive) in rows {
            println!(
                "{:<10} {:<15} {:<12} {:<8} {:<8} {:<5} {:<6}",
                truncate(&record.name, 10),
                record.ip,
                truncate(record.owner.as_deref().unwrap_or("-"), 12),
                record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                record.state,
                dead_marker(record, alive),
                record
                    .network_mode
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }

        Ok(())
    }

    /// Running records sorted by (owner, id), then free slots by id if
    /// requested. Each row carries the hypervisor liveness.
    fn rows<'a>(&self, pool: &'a Pool) -> Vec<(&'a VmRecord, bool)> {
        let mut running: Vec<&VmRecord> = pool.running.iter().collect();
        running.sort_by(|a, b| (&a.owner, a.id).cmp(&(&b.owner, b.id)));

        let mut rows: Vec<(&VmRecord, bool)> = running
            .into_iter()
            .map(|r| (r, r.is_process_alive()))
            .collect();

        if self.all {
            let mut free: Vec<&VmRecord> = pool.free.iter().collect();
            free.sort_by_key(|r| r.id);
            rows.extend(free.into_iter().map(|r| (r, false)));
        }
        rows
    }
}

/// `X` for a leased slot whose hypervisor is gone.
fn dead_marker(record: &VmRecord, alive: bool) -> &'static str {
    match record.state {
        SlotState::Running if !alive => "X",
        SlotState::Setup if !record.is_supervisor_alive() => "X",
        _ => "",
    }
}

/// Truncate a string to max length, adding "..." if needed.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

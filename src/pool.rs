//! Pool generation.
//!
//! Generation is the only place slot records are created. It assigns every
//! slot its id, IP, MAC and name, writes the store with all slots free, and
//! emits matching DHCP host entries so the guests get their fixed addresses.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::record::VmRecord;
use crate::store::{Pool, PoolStore};
use std::fmt::Write as _;
use std::path::Path;

/// Build a fresh pool of `count` free slots.
pub fn generate(config: &PoolConfig, count: u32) -> Result<Pool> {
    if count == 0 {
        return Err(Error::config("generate pool", "slot count must be at least 1"));
    }
    if count > config.max_vms {
        return Err(Error::config(
            "generate pool",
            format!("{} slots exceeds max_vms ({})", count, config.max_vms),
        ));
    }
    let addressable = config.network.max_slots();
    if count > addressable {
        return Err(Error::config(
            "generate pool",
            format!(
                "{} slots do not fit the network settings (at most {})",
                count, addressable
            ),
        ));
    }

    let mut pool = Pool::default();
    for id in 0..count {
        pool.push_free(VmRecord::new(
            id,
            config.network.ip_for(id),
            config.network.mac_for(id),
            config.slot_name(id),
        ));
    }
    Ok(pool)
}

/// Render one DHCP host entry per slot, in id order.
pub fn dhcp_entries(pool: &Pool) -> String {
    let mut records: Vec<&VmRecord> = pool.free.iter().chain(pool.running.iter()).collect();
    records.sort_by_key(|r| r.id);

    let mut out = String::new();
    for record in records {
        // Writing to a String cannot fail
        let _ = write!(
            out,
            "\thost {} {{\n\t\thardware ethernet {};\n\t\tfixed-address {};\n\t}}\n\n",
            record.name, record.mac, record.ip
        );
    }
    out
}

/// Write the DHCP host entries file.
pub fn write_dhcp(path: &Path, pool: &Pool) -> Result<()> {
    std::fs::write(path, dhcp_entries(pool))?;
    tracing::info!(path = %path.display(), "wrote dhcp entries");
    Ok(())
}

/// Regenerate the pool: wipe the store, mark every slot free, rewrite the
/// DHCP entries. Destructive; callers confirm with the operator first.
pub fn regenerate(config: &PoolConfig, count: u32) -> Result<Pool> {
    let pool = generate(config, count)?;
    let paths = config.paths();

    PoolStore::new(&paths).initialize(&pool)?;
    write_dhcp(&paths.dhcp, &pool)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PoolStore;
    use regex::Regex;

    fn test_config(dir: &Path) -> PoolConfig {
        PoolConfig {
            state_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_all_free_and_distinct() {
        let config = PoolConfig::default();
        for n in [1, 2, 17, 100] {
            let pool = generate(&config, n).unwrap();
            assert_eq!(pool.free.len(), n as usize);
            assert!(pool.running.is_empty());
            assert_eq!(pool.ids().len(), n as usize, "ids must be distinct");
            pool.check_partition().unwrap();

            let ips: std::collections::BTreeSet<_> = pool.free.iter().map(|r| &r.ip).collect();
            let macs: std::collections::BTreeSet<_> = pool.free.iter().map(|r| &r.mac).collect();
            assert_eq!(ips.len(), n as usize);
            assert_eq!(macs.len(), n as usize);
        }
    }

    #[test]
    fn test_generate_rejects_bad_counts() {
        let config = PoolConfig::default();
        assert!(generate(&config, 0).is_err());
        assert!(generate(&config, 101).is_err());

        let mut config = PoolConfig {
            max_vms: 500,
            ..Default::default()
        };
        // 172.20.0.100 + 155 would overflow the last octet
        assert!(generate(&config, 156).is_err());
        config.network.ip_offset = 1;
        assert!(generate(&config, 254).is_ok());
    }

    #[test]
    fn test_generate_addresses() {
        let pool = generate(&PoolConfig::default(), 3).unwrap();
        let mac_re = Regex::new(r"^([0-9A-F]{2}:){5}[0-9A-F]{2}$").unwrap();
        let ip_re = Regex::new(r"^172\.20\.0\.1\d\d$").unwrap();
        for record in &pool.free {
            assert!(mac_re.is_match(&record.mac), "bad mac {}", record.mac);
            assert!(ip_re.is_match(&record.ip), "bad ip {}", record.ip);
            assert_eq!(record.name, format!("vm{:02}", record.id));
        }
    }

    #[test]
    fn test_dhcp_entries() {
        let mut config = PoolConfig::default();
        config.names.insert("1".to_string(), "builder".to_string());
        let pool = generate(&config, 2).unwrap();

        let text = dhcp_entries(&pool);
        let expected = "\thost vm00 {\n\t\thardware ethernet DE:AD:BE:EF:01:00;\n\t\tfixed-address 172.20.0.100;\n\t}\n\n\
                        \thost builder {\n\t\thardware ethernet DE:AD:BE:EF:01:01;\n\t\tfixed-address 172.20.0.101;\n\t}\n\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_regenerate_writes_store_and_dhcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        regenerate(&config, 5).unwrap();

        let paths = config.paths();
        assert!(paths.lock.exists());
        assert!(paths.dhcp.exists());
        let dhcp = std::fs::read_to_string(&paths.dhcp).unwrap();
        assert_eq!(dhcp.matches("host vm").count(), 5);

        let pool = PoolStore::new(&paths)
            .read(|pool| Ok(pool.clone()))
            .unwrap();
        assert_eq!(pool.free.len(), 5);
        assert!(pool.running.is_empty());
    }
}

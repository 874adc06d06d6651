//! Persistent pool store.
//!
//! The pool lives in a redb database with a single table holding three keys:
//!
//! - `free`: JSON array of free slot records, ordered by descending id
//! - `running`: JSON array of leased slot records (setup or running)
//! - `sess_id`: session counter written at pool generation
//!
//! All access goes through [`PoolStore::read`] and [`PoolStore::transaction`],
//! which hold the pool lock for exactly `acquire -> load -> mutate -> save ->
//! release`. A transaction commits both collections in one redb write
//! transaction, so a crashed writer never leaves a partial save behind.

use crate::config::{PoolConfig, PoolPaths};
use crate::error::{Error, Result};
use crate::lock::PoolLock;
use crate::record::{SlotState, VmRecord};
use redb::{Database, TableDefinition};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const POOL_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pool");

const FREE_KEY: &str = "free";
const RUNNING_KEY: &str = "running";
const SESSION_KEY: &str = "sess_id";

/// Session counter value written by pool generation.
pub const INITIAL_SESSION_ID: u64 = 1000;

/// The two disjoint slot collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pool {
    /// Free slots, a stack ordered by descending id.
    pub free: Vec<VmRecord>,
    /// Leased slots.
    pub running: Vec<VmRecord>,
}

impl Pool {
    /// Take the next free slot (the lowest id).
    pub fn pop_free(&mut self) -> Option<VmRecord> {
        self.free.pop()
    }

    /// Return a slot to the free stack.
    pub fn push_free(&mut self, mut record: VmRecord) {
        record.state = SlotState::Free;
        self.free.push(record);
        self.free.sort_by(|a, b| b.id.cmp(&a.id));
    }

    /// Find a leased slot by id.
    pub fn find_running(&self, id: u32) -> Option<&VmRecord> {
        self.running.iter().find(|r| r.id == id)
    }

    /// Remove the leased slot matching `pred`.
    pub fn take_running<F>(&mut self, pred: F) -> Option<VmRecord>
    where
        F: Fn(&VmRecord) -> bool,
    {
        let index = self.running.iter().position(pred)?;
        Some(self.running.remove(index))
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.free.len() + self.running.len()
    }

    /// Whether the pool has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.free.is_empty() && self.running.is_empty()
    }

    /// Every slot id in either collection.
    pub fn ids(&self) -> BTreeSet<u32> {
        self.free
            .iter()
            .chain(self.running.iter())
            .map(|r| r.id)
            .collect()
    }

    /// Verify that no slot id appears twice across both collections.
    pub fn check_partition(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for record in self.free.iter().chain(self.running.iter()) {
            if !seen.insert(record.id) {
                return Err(Error::storage(
                    "check pool partition",
                    format!("slot {} appears more than once", record.id),
                ));
            }
        }
        Ok(())
    }
}

/// Lock-protected handle to the pool store.
#[derive(Debug, Clone)]
pub struct PoolStore {
    lock: PoolLock,
    path: PathBuf,
}

impl PoolStore {
    /// Create a store handle for the given pool files.
    pub fn new(paths: &PoolPaths) -> Self {
        Self {
            lock: PoolLock::new(&paths.lock),
            path: paths.store.clone(),
        }
    }

    /// Create a store handle for the configured state directory.
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(&config.paths())
    }

    /// Path to the store database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether both the store and its lock file exist.
    pub fn is_initialized(&self) -> bool {
        self.path.exists() && self.lock.path().exists()
    }

    /// Run `f` against a snapshot of the pool while holding the lock.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Pool) -> Result<T>,
    {
        let _guard = self.lock.acquire()?;
        let db = self.open_db()?;
        let pool = load(&db)?;
        f(&pool)
    }

    /// Run `f` as a transaction: the mutated pool is saved only if `f`
    /// returns `Ok`. An `Err` leaves the store exactly as it was.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Pool) -> Result<T>,
    {
        let _guard = self.lock.acquire()?;
        let db = self.open_db()?;
        let mut pool = load(&db)?;

        let value = f(&mut pool)?;

        pool.check_partition()?;
        save(&db, &pool)?;
        Ok(value)
    }

    /// Replace the store with `pool`, creating the lock file if needed.
    ///
    /// Used by pool generation. Runs under the lock so concurrent
    /// invocations never see a half-written store.
    pub fn initialize(&self, pool: &Pool) -> Result<()> {
        pool.check_partition()?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::storage("create state directory", e.to_string()))?;
        }
        if !self.lock.path().exists() {
            self.lock.create()?;
        }

        let _guard = self.lock.acquire()?;

        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .map_err(|e| Error::storage("remove old store", e.to_string()))?;
        }

        let db = Database::create(&self.path)
            .map_err(|e| Error::storage("create store", e.to_string()))?;
        let mut entries = pool_entries(pool)?;
        entries.push((SESSION_KEY, serde_json::to_vec(&INITIAL_SESSION_ID)?));
        write_keys(&db, &entries)?;
        drop(db);

        make_shared(&self.path)?;
        make_shared(self.lock.path())?;

        tracing::info!(
            path = %self.path.display(),
            slots = pool.len(),
            "pool store initialized"
        );
        Ok(())
    }

    /// Read the session counter.
    pub fn session_id(&self) -> Result<u64> {
        let _guard = self.lock.acquire()?;
        let db = self.open_db()?;
        let bytes = read_key(&db, SESSION_KEY)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn open_db(&self) -> Result<Database> {
        if !self.path.exists() {
            return Err(Error::PoolNotInitialized(self.path.clone()));
        }
        Database::open(&self.path).map_err(|e| Error::storage("open store", e.to_string()))
    }
}

fn load(db: &Database) -> Result<Pool> {
    let free = serde_json::from_slice(&read_key(db, FREE_KEY)?)?;
    let running = serde_json::from_slice(&read_key(db, RUNNING_KEY)?)?;
    Ok(Pool { free, running })
}

fn read_key(db: &Database, key: &str) -> Result<Vec<u8>> {
    let txn = db
        .begin_read()
        .map_err(|e| Error::storage("begin read", e.to_string()))?;
    let table = txn
        .open_table(POOL_TABLE)
        .map_err(|e| Error::storage("open pool table", e.to_string()))?;
    let value = table
        .get(key)
        .map_err(|e| Error::storage(format!("read {}", key), e.to_string()))?
        .ok_or_else(|| Error::storage(format!("read {}", key), "key missing from store"))?;
    Ok(value.value().to_vec())
}

fn save(db: &Database, pool: &Pool) -> Result<()> {
    write_keys(db, &pool_entries(pool)?)?;

    tracing::debug!(
        free = pool.free.len(),
        running = pool.running.len(),
        "pool saved"
    );
    Ok(())
}

fn pool_entries(pool: &Pool) -> Result<Vec<(&'static str, Vec<u8>)>> {
    Ok(vec![
        (FREE_KEY, serde_json::to_vec(&pool.free)?),
        (RUNNING_KEY, serde_json::to_vec(&pool.running)?),
    ])
}

/// Write every entry in one redb write transaction.
fn write_keys(db: &Database, entries: &[(&str, Vec<u8>)]) -> Result<()> {
    let txn = db
        .begin_write()
        .map_err(|e| Error::storage("begin write", e.to_string()))?;
    {
        let mut table = txn
            .open_table(POOL_TABLE)
            .map_err(|e| Error::storage("open pool table", e.to_string()))?;
        for (key, value) in entries {
            table
                .insert(*key, value.as_slice())
                .map_err(|e| Error::storage(format!("write {}", key), e.to_string()))?;
        }
    }
    txn.commit()
        .map_err(|e| Error::storage("commit", e.to_string()))
}

/// Make a pool file readable and writable by every user.
fn make_shared(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .map_err(|e| Error::storage(format!("chmod {}", path.display()), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn slot(id: u32) -> VmRecord {
        VmRecord::new(
            id,
            format!("10.0.0.{}", id + 10),
            format!("DE:AD:BE:EF:01:{:02X}", id),
            format!("vm{:02}", id),
        )
    }

    /// Create an initialized store with `n` free slots.
    fn temp_store(n: u32) -> (TempDir, PoolStore) {
        let dir = TempDir::new().unwrap();
        let store = PoolStore::new(&PoolPaths::new(dir.path()));
        let mut pool = Pool::default();
        for id in 0..n {
            pool.push_free(slot(id));
        }
        store.initialize(&pool).unwrap();
        (dir, store)
    }

    #[test]
    fn test_uninitialized_store() {
        let dir = TempDir::new().unwrap();
        let store = PoolStore::new(&PoolPaths::new(dir.path()));
        assert!(!store.is_initialized());
        assert!(matches!(
            store.read(|_| Ok(())),
            Err(Error::PoolNotInitialized(_))
        ));
    }

    #[test]
    fn test_initialize_and_read() {
        let (_dir, store) = temp_store(4);
        assert!(store.is_initialized());
        assert_eq!(store.session_id().unwrap(), INITIAL_SESSION_ID);

        let pool = store.read(|pool| Ok(pool.clone())).unwrap();
        assert_eq!(pool.free.len(), 4);
        assert!(pool.running.is_empty());
        let ids: Vec<u32> = pool.free.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_initialize_writes_every_key() {
        let (_dir, store) = temp_store(2);
        let db = Database::open(store.path()).unwrap();

        let txn = db.begin_read().unwrap();
        let table = txn.open_table(POOL_TABLE).unwrap();
        let keys: Vec<String> = table
            .iter()
            .unwrap()
            .map(|entry| entry.unwrap().0.value().to_string())
            .collect();
        assert_eq!(keys, [FREE_KEY, RUNNING_KEY, SESSION_KEY]);
    }

    #[test]
    fn test_transaction_commits() {
        let (_dir, store) = temp_store(3);

        let taken = store
            .transaction(|pool| {
                let record = pool.pop_free().ok_or(Error::NoFreeSlots)?;
                pool.running.push(record.clone());
                Ok(record.id)
            })
            .unwrap();
        assert_eq!(taken, 0);

        let pool = store.read(|pool| Ok(pool.clone())).unwrap();
        assert_eq!(pool.free.len(), 2);
        assert_eq!(pool.find_running(0).map(|r| r.id), Some(0));
    }

    #[test]
    fn test_failed_transaction_leaves_store_unchanged() {
        let (_dir, store) = temp_store(3);
        let before = store.read(|pool| Ok(pool.clone())).unwrap();

        // Crash between mutate and save
        let result: Result<()> = store.transaction(|pool| {
            let record = pool.pop_free().ok_or(Error::NoFreeSlots)?;
            pool.running.push(record);
            Err(Error::storage("simulated crash", "before save"))
        });
        assert!(result.is_err());

        let after = store.read(|pool| Ok(pool.clone())).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_partition_violation_is_not_saved() {
        let (_dir, store) = temp_store(2);
        let before = store.read(|pool| Ok(pool.clone())).unwrap();

        let result = store.transaction(|pool| {
            // Copy instead of move: slot now in both collections
            let record = pool.free[0].clone();
            pool.running.push(record);
            Ok(())
        });
        assert!(matches!(result, Err(Error::Storage { .. })));

        let after = store.read(|pool| Ok(pool.clone())).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_push_free_keeps_descending_order() {
        let mut pool = Pool::default();
        for id in [4, 1, 3, 0, 2] {
            pool.push_free(slot(id));
        }
        let ids: Vec<u32> = pool.free.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1, 0]);
        assert_eq!(pool.pop_free().map(|r| r.id), Some(0));
    }

    #[test]
    fn test_reinitialize_wipes_store() {
        let (dir, store) = temp_store(5);
        store
            .transaction(|pool| {
                let record = pool.pop_free().ok_or(Error::NoFreeSlots)?;
                pool.running.push(record);
                Ok(())
            })
            .unwrap();

        let mut pool = Pool::default();
        pool.push_free(slot(0));
        store.initialize(&pool).unwrap();

        let reloaded = PoolStore::new(&PoolPaths::new(dir.path()));
        let pool = reloaded.read(|pool| Ok(pool.clone())).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.running.is_empty());
    }
}

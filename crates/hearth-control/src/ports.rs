//! Port pools.
//!
//! Blocks are sequential and untranslated: the number reserved for a named
//! slot is the number the game listens on inside the guest and the number
//! forwarded on the gateway. Games without NAT awareness advertise the right
//! port this way.
//!
//! Search and reserve run under a per-pool lock, and the store's unique
//! `(pool, port)` constraint backs that up for anything outside this process.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use hearth_core::PortAllocation;
use uuid::Uuid;

use crate::store::{Store, StoreError};

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortAllocationError {
    #[error("unknown port pool: {0}")]
    UnknownPool(String),
    #[error("no block of {required} consecutive free ports in pool {pool}")]
    Exhausted { pool: String, required: usize },
    #[error("port store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub available: usize,
}

/// Lowest start such that `count` consecutive ports are all outside `used`.
pub fn first_free_block(range: PortRange, used: &BTreeSet<u16>, count: usize) -> Option<u16> {
    if count == 0 || count > range.len() {
        return None;
    }
    let mut run_start = range.start;
    let mut run_len = 0usize;
    for port in range.start..=range.end {
        if used.contains(&port) {
            run_len = 0;
            continue;
        }
        if run_len == 0 {
            run_start = port;
        }
        run_len += 1;
        if run_len == count {
            return Some(run_start);
        }
    }
    None
}

#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn Store>,
    pools: Arc<BTreeMap<String, PortRange>>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn Store>, pools: BTreeMap<String, PortRange>) -> Self {
        Self {
            store,
            pools: Arc::new(pools),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pools(&self) -> impl Iterator<Item = (&str, PortRange)> {
        self.pools.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn range(&self, pool: &str) -> Result<PortRange, PortAllocationError> {
        self.pools
            .get(pool)
            .copied()
            .ok_or_else(|| PortAllocationError::UnknownPool(pool.to_string()))
    }

    fn pool_lock(&self, pool: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(pool.to_string()).or_default().clone()
    }

    async fn used(&self, pool: &str) -> Result<BTreeSet<u16>, PortAllocationError> {
        Ok(self
            .store
            .list_port_allocations(pool)
            .await?
            .into_iter()
            .map(|a| a.port)
            .collect())
    }

    /// Read-only search for a block; nothing is reserved.
    pub async fn find_block(&self, pool: &str, required: usize) -> Result<u16, PortAllocationError> {
        let range = self.range(pool)?;
        let used = self.used(pool).await?;
        first_free_block(range, &used, required).ok_or_else(|| PortAllocationError::Exhausted {
            pool: pool.to_string(),
            required,
        })
    }

    pub async fn find_single(&self, pool: &str) -> Result<u16, PortAllocationError> {
        self.find_block(pool, 1).await
    }

    /// Reserves one port per slot, consecutive and in slot order.
    pub async fn allocate(
        &self,
        pool: &str,
        server_id: Uuid,
        slots: &[String],
    ) -> Result<BTreeMap<String, u16>, PortAllocationError> {
        let range = self.range(pool)?;
        if slots.is_empty() {
            return Ok(BTreeMap::new());
        }

        let lock = self.pool_lock(pool);
        let _guard = lock.lock().await;

        let used = self.used(pool).await?;
        let start = first_free_block(range, &used, slots.len()).ok_or_else(|| {
            PortAllocationError::Exhausted {
                pool: pool.to_string(),
                required: slots.len(),
            }
        })?;

        let rows: Vec<PortAllocation> = slots
            .iter()
            .zip(start..=range.end)
            .map(|(slot, port)| PortAllocation {
                pool: pool.to_string(),
                port,
                server_id,
                purpose: slot.clone(),
            })
            .collect();
        self.store.reserve_ports(&rows).await?;

        tracing::info!(
            pool,
            %server_id,
            start,
            count = rows.len(),
            "reserved port block"
        );
        Ok(rows.into_iter().map(|r| (r.purpose, r.port)).collect())
    }

    pub async fn allocate_single(
        &self,
        pool: &str,
        server_id: Uuid,
        purpose: &str,
    ) -> Result<u16, PortAllocationError> {
        let ports = self
            .allocate(pool, server_id, &[purpose.to_string()])
            .await?;
        ports
            .get(purpose)
            .copied()
            .ok_or_else(|| PortAllocationError::Exhausted {
                pool: pool.to_string(),
                required: 1,
            })
    }

    /// Drops every allocation owned by `server_id`, in every pool.
    pub async fn release(&self, server_id: Uuid) -> Result<u64, PortAllocationError> {
        let removed = self.store.release_ports(server_id).await?;
        if removed > 0 {
            tracing::info!(%server_id, removed, "released ports");
        }
        Ok(removed)
    }

    pub async fn stats(&self, pool: &str) -> Result<PoolStats, PortAllocationError> {
        let range = self.range(pool)?;
        let used = self
            .used(pool)
            .await?
            .into_iter()
            .filter(|p| range.contains(*p))
            .count();
        let total = range.len();
        Ok(PoolStats {
            total,
            used,
            available: total.saturating_sub(used),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn allocator(store: Arc<MemoryStore>, start: u16, end: u16) -> PortAllocator {
        let mut pools = BTreeMap::new();
        pools.insert("game".to_string(), PortRange::new(start, end));
        pools.insert("sftp".to_string(), PortRange::new(2200, 2201));
        PortAllocator::new(store, pools)
    }

    fn slots(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_free_block_skips_fragmented_gaps() {
        let range = PortRange::new(100, 110);
        let used: BTreeSet<u16> = [101, 104, 105].into_iter().collect();
        assert_eq!(first_free_block(range, &used, 1), Some(100));
        assert_eq!(first_free_block(range, &used, 2), Some(102));
        assert_eq!(first_free_block(range, &used, 3), Some(106));
        assert_eq!(first_free_block(range, &used, 5), Some(106));
        assert_eq!(first_free_block(range, &used, 6), None);
        assert_eq!(first_free_block(range, &used, 0), None);
    }

    #[test]
    fn block_can_end_on_the_last_port() {
        let range = PortRange::new(65534, 65535);
        assert_eq!(first_free_block(range, &BTreeSet::new(), 2), Some(65534));
    }

    #[tokio::test]
    async fn empty_pool_yields_the_lowest_block_in_slot_order() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(store, 27000, 27499);
        let server = Uuid::new_v4();
        let ports = alloc
            .allocate("game", server, &slots(&["query", "rcon"]))
            .await
            .unwrap();
        assert_eq!(ports["query"], 27000);
        assert_eq!(ports["rcon"], 27001);
    }

    #[tokio::test]
    async fn single_free_port_cannot_hold_two_slots() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(store, 27000, 27002);
        alloc
            .allocate("game", Uuid::new_v4(), &slots(&["a", "b"]))
            .await
            .unwrap();
        let err = alloc
            .allocate("game", Uuid::new_v4(), &slots(&["game", "query"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PortAllocationError::Exhausted { required: 2, .. }
        ));
        // The lone port is still usable.
        assert_eq!(alloc.find_single("game").await.unwrap(), 27002);
    }

    #[tokio::test]
    async fn allocations_never_collide_and_stay_consecutive() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(store.clone(), 30000, 30099);
        let mut tasks = Vec::new();
        for i in 0..12 {
            let alloc = alloc.clone();
            tasks.push(tokio::spawn(async move {
                let n = 1 + i % 4;
                let names: Vec<String> = (0..n).map(|k| format!("p{k}")).collect();
                alloc.allocate("game", Uuid::new_v4(), &names).await
            }));
        }

        let mut seen = BTreeSet::new();
        for t in tasks {
            let ports = t.await.unwrap().unwrap();
            let mut nums: Vec<u16> = ports.values().copied().collect();
            nums.sort_unstable();
            for w in nums.windows(2) {
                assert_eq!(w[1], w[0] + 1);
            }
            for p in nums {
                assert!((30000..=30099).contains(&p));
                assert!(seen.insert(p), "port {p} handed out twice");
            }
        }
    }

    #[tokio::test]
    async fn release_spans_pools_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(store.clone(), 27000, 27010);
        let server = Uuid::new_v4();
        let other = Uuid::new_v4();
        alloc
            .allocate("game", server, &slots(&["game", "query"]))
            .await
            .unwrap();
        alloc.allocate_single("sftp", server, "sftp").await.unwrap();
        alloc.allocate_single("game", other, "game").await.unwrap();

        assert_eq!(alloc.release(server).await.unwrap(), 3);
        assert_eq!(alloc.release(server).await.unwrap(), 0);

        let left = store.list_port_allocations("game").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].server_id, other);
        assert!(store.list_port_allocations("sftp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_reflect_usage() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(store, 27000, 27009);
        alloc
            .allocate("game", Uuid::new_v4(), &slots(&["a", "b", "c"]))
            .await
            .unwrap();
        let stats = alloc.stats("game").await.unwrap();
        assert_eq!(
            stats,
            PoolStats {
                total: 10,
                used: 3,
                available: 7
            }
        );
        assert!(matches!(
            alloc.stats("voice").await,
            Err(PortAllocationError::UnknownPool(_))
        ));
    }
}

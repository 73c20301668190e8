//! In-memory cache
//!
//! A small data container with an optional persisted tier and optional
//! transactions, enough to act as both the source and the target of a push.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use async_trait::async_trait;

use super::{
    EntryIter, EntrySource, InvocationContext, TransactionManager, WriteFlags, WritePipeline,
    XSiteState,
};
use crate::error::{Error, Result};
use crate::state::SegmentFilter;

/// In-memory data container
pub struct MemoryCache {
    /// Entries resident in memory
    memory: RwLock<BTreeMap<Vec<u8>, XSiteState>>,
    /// Entries only present in the persistent store
    store: RwLock<BTreeMap<Vec<u8>, XSiteState>>,
    /// Whether the store takes part in state transfer
    store_in_state_transfer: bool,
    /// Whether writes can be grouped in transactions
    transactional: bool,
    /// Writes staged by open transactions
    staged: Mutex<HashMap<u64, Vec<XSiteState>>>,
    next_tx: AtomicU64,
    tracking: AtomicBool,
    tracked: Mutex<HashSet<Vec<u8>>>,
}

impl MemoryCache {
    /// Non-transactional cache whose store takes part in state transfer
    pub fn new() -> Self {
        Self {
            memory: RwLock::new(BTreeMap::new()),
            store: RwLock::new(BTreeMap::new()),
            store_in_state_transfer: true,
            transactional: false,
            staged: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
            tracking: AtomicBool::new(false),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Transactional variant
    pub fn transactional() -> Self {
        Self {
            transactional: true,
            ..Self::new()
        }
    }

    /// Exclude the persistent store from state transfer
    pub fn without_store_transfer(mut self) -> Self {
        self.store_in_state_transfer = false;
        self
    }

    /// Insert an entry in memory
    pub fn insert(&self, state: XSiteState) {
        write(&self.memory).insert(state.key().to_vec(), state);
    }

    /// Insert an entry that only exists in the persistent store
    pub fn insert_persisted(&self, state: XSiteState) {
        write(&self.store).insert(state.key().to_vec(), state);
    }

    /// Look an entry up in memory, then in the store
    pub fn get(&self, key: &[u8]) -> Option<XSiteState> {
        if let Some(state) = read(&self.memory).get(key) {
            return Some(state.clone());
        }
        read(&self.store).get(key).cloned()
    }

    /// Number of entries resident in memory
    pub fn len(&self) -> usize {
        read(&self.memory).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether state transfer writes are being tracked
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    /// Keys written by state transfer since tracking started
    pub fn tracked_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<_> = lock(&self.tracked).iter().cloned().collect();
        keys.sort();
        keys
    }

    fn snapshot(map: &RwLock<BTreeMap<Vec<u8>, XSiteState>>, filter: &SegmentFilter) -> Vec<XSiteState> {
        read(map)
            .values()
            .filter(|s| filter.contains_key(s.key()))
            .cloned()
            .collect()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntrySource for MemoryCache {
    fn memory_entries(&self, filter: &SegmentFilter) -> EntryIter {
        Box::new(Self::snapshot(&self.memory, filter).into_iter().map(Ok))
    }

    fn persisted_entries(&self, filter: &SegmentFilter) -> EntryIter {
        if !self.store_in_state_transfer {
            return Box::new(std::iter::empty());
        }
        Box::new(Self::snapshot(&self.store, filter).into_iter().map(Ok))
    }

    fn contains_in_memory(&self, key: &[u8]) -> bool {
        read(&self.memory).contains_key(key)
    }
}

#[async_trait]
impl WritePipeline for MemoryCache {
    async fn put(&self, ctx: &mut InvocationContext, state: &XSiteState, flags: WriteFlags) -> Result<()> {
        match ctx.transaction() {
            Some(tx) => {
                let mut staged = lock(&self.staged);
                let writes = staged
                    .get_mut(&tx)
                    .ok_or_else(|| Error::Transaction(format!("transaction {} is not active", tx)))?;
                writes.push(state.clone());
            }
            None => {
                write(&self.memory).insert(state.key().to_vec(), state.clone());
            }
        }

        if flags.state_transfer && self.is_tracking() {
            lock(&self.tracked).insert(state.key().to_vec());
        }
        ctx.record_write();
        Ok(())
    }

    fn transactions(&self) -> Option<&dyn TransactionManager> {
        if self.transactional {
            Some(self as &dyn TransactionManager)
        } else {
            None
        }
    }

    fn start_tracking(&self) {
        lock(&self.tracked).clear();
        self.tracking.store(true, Ordering::SeqCst);
    }

    fn stop_tracking(&self) {
        self.tracking.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionManager for MemoryCache {
    async fn begin(&self) -> Result<InvocationContext> {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        lock(&self.staged).insert(id, Vec::new());
        Ok(InvocationContext::in_transaction(id))
    }

    async fn commit(&self, ctx: InvocationContext) -> Result<()> {
        let tx = ctx
            .transaction()
            .ok_or_else(|| Error::Transaction("commit outside a transaction".into()))?;
        let writes = lock(&self.staged)
            .remove(&tx)
            .ok_or_else(|| Error::Transaction(format!("transaction {} is not active", tx)))?;

        let mut memory = write(&self.memory);
        for state in writes {
            memory.insert(state.key().to_vec(), state);
        }
        Ok(())
    }

    async fn rollback(&self, ctx: InvocationContext) -> Result<()> {
        if let Some(tx) = ctx.transaction() {
            lock(&self.staged).remove(&tx);
        }
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CacheTopology;

    fn entry(key: &str, value: &str) -> XSiteState {
        XSiteState::new(key.as_bytes(), value.as_bytes(), Vec::new(), Vec::new())
    }

    fn everything() -> SegmentFilter {
        CacheTopology::round_robin(1, vec!["A".into()], 4, false).primary_segments("A")
    }

    #[test]
    fn test_entry_sources() {
        let cache = MemoryCache::new();
        cache.insert(entry("k1", "v1"));
        cache.insert_persisted(entry("k2", "v2"));

        let memory: Vec<_> = cache.memory_entries(&everything()).collect::<Result<_>>().unwrap();
        let persisted: Vec<_> = cache.persisted_entries(&everything()).collect::<Result<_>>().unwrap();
        assert_eq!(memory, vec![entry("k1", "v1")]);
        assert_eq!(persisted, vec![entry("k2", "v2")]);
        assert!(cache.contains_in_memory(b"k1"));
        assert!(!cache.contains_in_memory(b"k2"));

        let cache = cache.without_store_transfer();
        assert_eq!(cache.persisted_entries(&everything()).count(), 0);
    }

    #[tokio::test]
    async fn test_transaction_staging() {
        let cache = MemoryCache::transactional();
        let tm = cache.transactions().unwrap();

        let mut ctx = tm.begin().await.unwrap();
        cache.put(&mut ctx, &entry("a", "1"), WriteFlags::default()).await.unwrap();
        assert!(cache.get(b"a").is_none());
        tm.commit(ctx).await.unwrap();
        assert_eq!(cache.get(b"a"), Some(entry("a", "1")));

        let mut ctx = tm.begin().await.unwrap();
        cache.put(&mut ctx, &entry("b", "2"), WriteFlags::default()).await.unwrap();
        tm.rollback(ctx).await.unwrap();
        assert!(cache.get(b"b").is_none());
    }

    #[tokio::test]
    async fn test_tracking() {
        let cache = MemoryCache::new();
        assert!(cache.transactions().is_none());

        let mut ctx = InvocationContext::non_transactional();
        cache.put(&mut ctx, &entry("a", "1"), WriteFlags::XSITE_STATE_TRANSFER).await.unwrap();
        assert!(cache.tracked_keys().is_empty());

        cache.start_tracking();
        cache.put(&mut ctx, &entry("b", "1"), WriteFlags::XSITE_STATE_TRANSFER).await.unwrap();
        cache.put(&mut ctx, &entry("c", "1"), WriteFlags::default()).await.unwrap();
        cache.stop_tracking();

        assert_eq!(cache.tracked_keys(), vec![b"b".to_vec()]);
        assert_eq!(ctx.writes(), 3);
    }
}

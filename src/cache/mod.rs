//! Cache Module
//!
//! The parts of the cache that state transfer reads from and writes into:
//! the entry source on the sending side, the write pipeline on the receiving
//! side, and conflict tracking for asynchronous backups.

mod irac;
mod memory;

pub use irac::IracForwarder;
pub use memory::MemoryCache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::SegmentFilter;

/// One replicated entry: key, value, metadata, and replication-only metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XSiteState {
    key: Vec<u8>,
    value: Vec<u8>,
    metadata: Vec<u8>,
    internal_metadata: Vec<u8>,
}

impl XSiteState {
    pub fn new(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        metadata: impl Into<Vec<u8>>,
        internal_metadata: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: metadata.into(),
            internal_metadata: internal_metadata.into(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn internal_metadata(&self) -> &[u8] {
        &self.internal_metadata
    }
}

/// Lazily produced entries
pub type EntryIter = Box<dyn Iterator<Item = Result<XSiteState>> + Send>;

/// Where a push reads locally owned entries from
pub trait EntrySource: Send + Sync {
    /// Entries resident in memory whose key falls in `filter`
    fn memory_entries(&self, filter: &SegmentFilter) -> EntryIter;

    /// Entries in persistent stores that take part in state transfer
    fn persisted_entries(&self, filter: &SegmentFilter) -> EntryIter;

    /// Whether `key` is resident in memory
    fn contains_in_memory(&self, key: &[u8]) -> bool;
}

/// Flags attached to a write going through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags {
    pub state_transfer: bool,
    pub ignore_return_value: bool,
    pub skip_remote_lookup: bool,
    pub skip_xsite_backup: bool,
}

impl WriteFlags {
    /// Flags for a put applied from an incoming state chunk
    pub const XSITE_STATE_TRANSFER: WriteFlags = WriteFlags {
        state_transfer: true,
        ignore_return_value: true,
        skip_remote_lookup: true,
        skip_xsite_backup: true,
    };
}

/// Per-invocation context; carries the transaction when there is one
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvocationContext {
    transaction: Option<u64>,
    writes: usize,
}

impl InvocationContext {
    /// A context outside any transaction
    pub fn non_transactional() -> Self {
        Self::default()
    }

    /// A context bound to transaction `id`
    pub fn in_transaction(id: u64) -> Self {
        Self {
            transaction: Some(id),
            writes: 0,
        }
    }

    pub fn transaction(&self) -> Option<u64> {
        self.transaction
    }

    /// Number of writes performed with this context
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub(crate) fn record_write(&mut self) {
        self.writes += 1;
    }
}

/// Transaction demarcation for a transactional cache
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<InvocationContext>;
    async fn commit(&self, ctx: InvocationContext) -> Result<()>;
    async fn rollback(&self, ctx: InvocationContext) -> Result<()>;
}

/// The normal write path of the cache
#[async_trait]
pub trait WritePipeline: Send + Sync {
    /// Apply a put through the invocation pipeline
    async fn put(&self, ctx: &mut InvocationContext, state: &XSiteState, flags: WriteFlags) -> Result<()>;

    /// The transaction manager, if the cache is transactional
    fn transactions(&self) -> Option<&dyn TransactionManager>;

    /// Start tracking keys written by state transfer, for reconciliation with concurrent writes
    fn start_tracking(&self);

    /// Stop tracking state transfer writes
    fn stop_tracking(&self);
}

/// Conflict tracking used to deliver asynchronous backups
#[async_trait]
pub trait ConflictTracker: Send + Sync {
    /// Queue a chunk for eventual delivery to `site`
    async fn track_for_state_transfer(&self, site: &str, chunk: Vec<XSiteState>) -> Result<()>;
}

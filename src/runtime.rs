//! Index runtime (§3) and the lookup contract the write pipeline and search
//! executor use to resolve a live index by name without depending on the
//! index manager module directly (keeps C5/C8 decoupled from C6's state
//! machine).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::router::shard_of;
use crate::settings::IndexSetting;
use crate::shard::Shard;

/// A fully built, online index: its setting plus its shards. Exists in the
/// `indexRegistration` registry iff the index's state is `Online`
/// (invariant 1, §3).
pub struct IndexRuntime {
    pub setting: IndexSetting,
    pub shards: Vec<Arc<Shard>>,
    pub cancellation: CancellationToken,
}

impl IndexRuntime {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Resolves the shard a given document id routes to under this
    /// runtime's fixed shard count (invariant 2, §3).
    pub fn shard_for(&self, id: &str) -> &Arc<Shard> {
        &self.shards[shard_of(id, self.shards.len())]
    }
}

/// Resolves a live (`Online`) index runtime by name. Implemented by the
/// index manager (C6); depended on abstractly by the write pipeline (C5)
/// and search executor (C8).
pub trait IndexLookup: Send + Sync {
    fn get_online(&self, name: &str) -> Option<Arc<IndexRuntime>>;
}

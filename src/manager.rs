//! Index manager (C6).
//!
//! Drives the per-index lifecycle state machine, owns the two process-scope
//! registries (§3), builds writer and reader state for each shard from a
//! loaded definition, and runs the per-index commit/refresh schedulers
//! described in §4.6.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{FlexError, FlexResult};
use crate::registry::Registry;
use crate::runtime::{IndexLookup, IndexRuntime};
use crate::schema::build_schema;
use crate::settings::{AnalyzerResolver, IndexDefinition, SettingsBuilder};
use crate::shard::{spawn_reopen_worker, Shard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Opening,
    Online,
    Closing,
    Offline,
}

/// Persists index definitions (`IPersistenceStore`, §6). The real,
/// disk-backed settings store is an external collaborator (§1) — this
/// crate only depends on the trait boundary. [`InMemoryDefinitionStore`]
/// below is a minimal stand-in used by default and by tests.
pub trait IndexDefinitionStore: Send + Sync {
    fn get(&self, name: &str) -> Option<IndexDefinition>;
    fn put(&self, definition: IndexDefinition);
    fn delete(&self, name: &str);
    fn get_all(&self) -> Vec<IndexDefinition>;
}

#[derive(Default)]
pub struct InMemoryDefinitionStore {
    inner: Mutex<HashMap<String, IndexDefinition>>,
}

impl IndexDefinitionStore for InMemoryDefinitionStore {
    fn get(&self, name: &str) -> Option<IndexDefinition> {
        self.inner.lock().get(&name.to_ascii_lowercase()).cloned()
    }

    fn put(&self, definition: IndexDefinition) {
        self.inner.lock().insert(definition.name.to_ascii_lowercase(), definition);
    }

    fn delete(&self, name: &str) {
        self.inner.lock().remove(&name.to_ascii_lowercase());
    }

    fn get_all(&self) -> Vec<IndexDefinition> {
        self.inner.lock().values().cloned().collect()
    }
}

/// Per-index lifecycle manager: `Add`/`Open`/`Update`/`Close`/`Delete`/`Status`
/// (§4.6). Owns both process-scope registries described in §3.
pub struct IndexManager {
    registration: Arc<Registry<Arc<IndexRuntime>>>,
    status: Arc<Registry<IndexState>>,
    definitions: Arc<dyn IndexDefinitionStore>,
    resolver: Arc<dyn AnalyzerResolver>,
}

impl IndexLookup for IndexManager {
    fn get_online(&self, name: &str) -> Option<Arc<IndexRuntime>> {
        self.registration.get(name)
    }
}

impl IndexManager {
    pub fn new(definitions: Arc<dyn IndexDefinitionStore>, resolver: Arc<dyn AnalyzerResolver>) -> Self {
        Self {
            registration: Registry::new(),
            status: Registry::new(),
            definitions,
            resolver,
        }
    }

    pub fn status(&self, name: &str) -> Option<IndexState> {
        self.status.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.status.contains(name)
    }

    pub fn get_online(&self, name: &str) -> FlexResult<Arc<IndexRuntime>> {
        self.registration
            .get(name)
            .ok_or_else(|| match self.status.get(name) {
                Some(IndexState::Offline) => FlexError::IndexIsOffline(name.to_string()),
                Some(IndexState::Opening) => FlexError::IndexIsOpening(name.to_string()),
                Some(_) => FlexError::IndexRegistrationMissing(name.to_string()),
                None => FlexError::IndexNotFound(name.to_string()),
            })
    }

    /// `Add`: persists the definition; if `online`, also builds the runtime.
    pub fn add(&self, definition: IndexDefinition, online: bool) -> FlexResult<()> {
        if self.status.contains(&definition.name) {
            return Err(FlexError::IndexAlreadyExists(definition.name));
        }

        self.status.put(&definition.name, IndexState::Opening);
        self.definitions.put(definition.clone());

        if online {
            match self.build_runtime(&definition) {
                Ok(runtime) => {
                    self.registration.put(&definition.name, runtime);
                    self.status.put(&definition.name, IndexState::Online);
                    Ok(())
                }
                Err(e) => {
                    self.status.put(&definition.name, IndexState::Offline);
                    Err(e)
                }
            }
        } else {
            self.status.put(&definition.name, IndexState::Offline);
            Ok(())
        }
    }

    /// `Update`: close then re-add. Rejected while `Opening` (§4.6 table).
    pub fn update(&self, definition: IndexDefinition) -> FlexResult<()> {
        match self.status.get(&definition.name) {
            Some(IndexState::Opening) => return Err(FlexError::IndexIsOpening(definition.name)),
            Some(IndexState::Online) => {
                self.close(&definition.name)?;
            }
            Some(_) | None => {}
        }

        self.definitions.delete(&definition.name);
        self.status.remove(&definition.name);
        self.add(definition, true)
    }

    /// `Delete`: closes if open, then removes the on-disk directory and the
    /// persisted definition. Close errors are non-fatal (§7).
    pub fn delete(&self, name: &str) -> FlexResult<()> {
        if !self.status.contains(name) {
            return Err(FlexError::IndexNotFound(name.to_string()));
        }

        if matches!(self.status.get(name), Some(IndexState::Online)) {
            let _ = self.close(name);
        }

        if let Some(definition) = self.definitions.get(name) {
            let root = definition.base_directory.join(&definition.name);
            if root.exists() {
                let _ = std::fs::remove_dir_all(root);
            }
        }

        self.definitions.delete(name);
        self.status.remove(name);
        Ok(())
    }

    /// `Close`: commits and releases every shard, cancels the schedulers.
    pub fn close(&self, name: &str) -> FlexResult<()> {
        match self.status.get(name) {
            Some(IndexState::Online) => {}
            _ => return Err(FlexError::IndexNotFound(name.to_string())),
        }

        self.status.put(name, IndexState::Closing);

        if let Some(runtime) = self.registration.remove(name) {
            runtime.cancellation.cancel();
            for shard in &runtime.shards {
                let shard = shard.clone();
                // Close errors are non-fatal; the state still transitions (§7).
                let _ = futures_block_on_close(shard);
            }
        }

        self.status.put(name, IndexState::Offline);
        Ok(())
    }

    /// `Open`: rebuilds the runtime from the persisted definition.
    pub fn open(&self, name: &str) -> FlexResult<()> {
        match self.status.get(name) {
            Some(IndexState::Offline) => {}
            Some(IndexState::Online) => return Ok(()),
            _ => return Err(FlexError::IndexNotFound(name.to_string())),
        }

        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| FlexError::IndexRegistrationMissing(name.to_string()))?;

        self.status.put(name, IndexState::Opening);
        match self.build_runtime(&definition) {
            Ok(runtime) => {
                self.registration.put(name, runtime);
                self.status.put(name, IndexState::Online);
                Ok(())
            }
            Err(e) => {
                self.status.put(name, IndexState::Offline);
                Err(e)
            }
        }
    }

    fn build_runtime(&self, definition: &IndexDefinition) -> FlexResult<Arc<IndexRuntime>> {
        let setting = SettingsBuilder::build_setting(definition, self.resolver.as_ref())?;
        let schema = build_schema(&setting);

        let mut shards = Vec::with_capacity(setting.shard_count);
        for n in 0..setting.shard_count {
            let path = setting.shard_path(n);
            let shard = Shard::open(&setting, schema.clone(), n, &path)
                .map_err(|e| FlexError::OpeningIndexWriter(e.to_string()))?;
            shards.push(Arc::new(shard));
        }

        let cancellation = CancellationToken::new();
        let runtime = Arc::new(IndexRuntime {
            setting,
            shards,
            cancellation: cancellation.clone(),
        });

        spawn_schedulers(runtime.clone());

        Ok(runtime)
    }
}

/// Best-effort synchronous close from a non-async context: the manager's
/// public API is synchronous (§4.6 table), while shard close is async
/// (writer actor ordering, §4.2). Tokio forbids nesting a runtime inside an
/// already-running one on the same thread, so the bridge runs on a fresh OS
/// thread with its own current-thread runtime instead of trying to block on
/// the caller's own executor.
fn futures_block_on_close(shard: Arc<Shard>) -> anyhow::Result<()> {
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(async move { shard.close().await })
    })
    .join()
    .unwrap_or_else(|_| Err(anyhow::Error::msg("shard close thread panicked")))
}

/// Spawns the two cooperative scheduler loops for an online index (§4.6):
/// a commit loop and a refresh loop, both terminated by the runtime's
/// cancellation token at the next tick.
fn spawn_schedulers(runtime: Arc<IndexRuntime>) {
    let commit_period = Duration::from_secs(runtime.setting.commit_period_secs.max(1));
    let refresh_period = Duration::from_millis(runtime.setting.refresh_period_ms.clamp(5, 25));

    let commit_runtime = runtime.clone();
    let commit_token = runtime.cancellation.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = commit_token.cancelled() => break,
                _ = tokio::time::sleep(commit_period) => {}
            }
            for shard in &commit_runtime.shards {
                if let Err(e) = shard.commit_if_dirty().await {
                    // Scheduler errors are swallowed; the loop continues (§7).
                    warn!("commit loop failed for shard {}: {:?}", shard.shard_number, e);
                }
            }
        }
    });

    for shard in runtime.shards.iter().cloned() {
        let weak = Arc::downgrade(&shard);
        spawn_reopen_worker(weak, refresh_period, runtime.cancellation.clone());
    }
}

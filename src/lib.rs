//! A multi-index, sharded full-text search engine built on tantivy.
//!
//! [`Engine`] is the top-level facade composing the index manager (C6),
//! write pipeline (C5) and search executor (C8) behind the abstract
//! `IndexService`/`SearchService` contracts (§6). Individual modules are
//! usable on their own for embedding or testing; most callers only need
//! this facade.

#[macro_use]
extern crate log;

pub mod document;
pub mod error;
pub mod field;
pub mod logging;
pub mod manager;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod schema;
pub mod search;
pub mod settings;
pub mod shard;
pub mod versioning;

use std::sync::Arc;

use tantivy::query::Query;
use tantivy::tokenizer::TokenizerManager;

pub use error::{FlexError, FlexResult};

use manager::{IndexDefinitionStore, IndexManager, IndexState, InMemoryDefinitionStore};
use pipeline::{Command, CommandResult, WriteCommand, WritePipeline};
use query::{ProfileSelector, SearchProfileQuery, SearchProfiles, StrategyRegistry};
use runtime::IndexLookup;
use search::{SearchQuery, SearchResult};
use settings::{AnalyzerResolver, DefaultAnalyzerResolver, IndexDefinition};

/// Bootstrap configuration for an [`Engine`] instance (§4.12).
///
/// There is no persistence backend bundled (§1 scope: the real
/// `IPersistenceStore` is an external collaborator); `definitions` defaults
/// to an in-memory stand-in so a fresh `Engine::new()` works out of the box
/// for embedding and tests.
pub struct EngineConfig {
    pub data_root: std::path::PathBuf,
    pub write_parallelism: usize,
    pub write_queue_capacity: usize,
    pub definitions: Arc<dyn IndexDefinitionStore>,
    pub analyzer_resolver: Arc<dyn AnalyzerResolver>,
    pub profile_selector: Option<Arc<dyn ProfileSelector>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: std::path::PathBuf::from("./flexsearch-data"),
            write_parallelism: num_cpus::get().max(1),
            write_queue_capacity: 1000,
            definitions: Arc::new(InMemoryDefinitionStore::default()),
            analyzer_resolver: Arc::new(DefaultAnalyzerResolver::new(Vec::new())),
            profile_selector: None,
        }
    }
}

/// The top-level `IndexService`/`SearchService` facade (§6).
pub struct Engine {
    manager: Arc<IndexManager>,
    pipeline: WritePipeline,
    versioning: Arc<versioning::VersioningCache>,
    tokenizers: Arc<TokenizerManager>,
    profiles: parking_lot::RwLock<SearchProfiles>,
    profile_selector: Option<Arc<dyn ProfileSelector>>,
    strategy_registry: StrategyRegistry,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let manager = Arc::new(IndexManager::new(config.definitions, config.analyzer_resolver));
        let versioning = versioning::VersioningCache::new();
        let lookup: Arc<dyn IndexLookup> = manager.clone();

        let pipeline = WritePipeline::with_config(
            lookup,
            versioning.clone(),
            config.write_parallelism,
            config.write_queue_capacity,
        );

        Self {
            manager,
            pipeline,
            versioning,
            tokenizers: Arc::new(TokenizerManager::default()),
            profiles: parking_lot::RwLock::new(SearchProfiles::new()),
            profile_selector: config.profile_selector,
            strategy_registry: StrategyRegistry::new(),
        }
    }

    // -- IndexService -----------------------------------------------------

    pub fn add_index(&self, definition: IndexDefinition, online: bool) -> FlexResult<()> {
        self.manager.add(definition, online)
    }

    pub fn update_index(&self, definition: IndexDefinition) -> FlexResult<()> {
        self.manager.update(definition)
    }

    pub fn delete_index(&self, name: &str) -> FlexResult<()> {
        self.versioning.clear_index(name);
        self.manager.delete(name)
    }

    pub fn open_index(&self, name: &str) -> FlexResult<()> {
        self.manager.open(name)
    }

    pub fn close_index(&self, name: &str) -> FlexResult<()> {
        self.manager.close(name)
    }

    pub fn get_index(&self, name: &str) -> FlexResult<Arc<runtime::IndexRuntime>> {
        self.manager.get_online(name)
    }

    pub fn index_exists(&self, name: &str) -> bool {
        self.manager.exists(name)
    }

    pub fn index_status(&self, name: &str) -> Option<IndexState> {
        self.manager.status(name)
    }

    /// `performCommand`: submits a write command and awaits its result.
    pub async fn perform_command(&self, index_name: &str, command: Command) -> CommandResult {
        self.pipeline
            .submit(WriteCommand {
                index_name: index_name.to_string(),
                command,
            })
            .await
    }

    /// `performCommandAsync`: fire-and-forget submission with an explicit
    /// reply channel, for callers that poll or fan results back out
    /// themselves (§6).
    pub fn perform_command_async(
        &self,
        index_name: &str,
        command: Command,
        reply: std::sync::mpsc::SyncSender<CommandResult>,
    ) {
        self.pipeline.submit_async(
            WriteCommand {
                index_name: index_name.to_string(),
                command,
            },
            reply,
        );
    }

    /// Registers or replaces a named search profile (§4.7).
    pub fn put_search_profile(&self, name: impl Into<String>, filter: query::SearchFilter) {
        self.profiles.write().insert(name.into(), filter);
    }

    // -- SearchService ------------------------------------------------------

    /// `search`: compiles `filter` against `index` and executes it (§4.7, §4.8).
    pub async fn search(
        &self,
        index: &str,
        filter: &query::SearchFilter,
        request: SearchQuery,
    ) -> FlexResult<SearchResult> {
        let runtime = self.manager.get_online(index)?;
        let compiled: Arc<dyn Query> = query::compile(
            &runtime,
            filter,
            true,
            &self.strategy_registry,
            &self.tokenizers,
            None,
        )?
        .into();

        search::search(runtime, compiled, request, self.tokenizers.clone())
            .await
    }

    /// `searchProfile`: resolves a named/selected profile and executes it
    /// (§4.7, §4.8).
    pub async fn search_profile(
        &self,
        index: &str,
        profile_query: SearchProfileQuery,
        request: SearchQuery,
    ) -> FlexResult<SearchResult> {
        let runtime = self.manager.get_online(index)?;
        let profiles = self.profiles.read();
        let compiled: Arc<dyn Query> = query::compile_profile(
            &runtime,
            &profiles,
            &profile_query,
            self.profile_selector.as_deref(),
            &self.strategy_registry,
            &self.tokenizers,
        )?
        .into();
        drop(profiles);

        search::search(runtime, compiled, request, self.tokenizers.clone())
            .await
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

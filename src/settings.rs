//! Settings builder (C9).
//!
//! Validates a user-supplied index definition into an immutable
//! [`IndexSetting`]. Analyzer/tokenizer resolution is treated as an external
//! resolver contract (§1 scope) — this module only checks that a referenced
//! analyzer name resolves against the supplied [`AnalyzerResolver`], it does
//! not implement tokenization itself.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use crate::document::is_reserved;
use crate::error::{FlexError, FlexResult};
use crate::field::{FieldDescriptor, FieldKind, PostingsOptions, TermVectorOptions};

/// Built-in analyzer names always resolvable without a custom definition,
/// matching tantivy's bundled `TokenizerManager` defaults.
const BUILT_IN_ANALYZERS: [&str; 4] = ["default", "raw", "whitespace", "keyword"];

/// External resolver contract for analyzer/tokenizer/filter plugins (§1).
/// A concrete implementation lives outside this crate; it is only consulted
/// here to validate that a referenced name is resolvable.
pub trait AnalyzerResolver: Send + Sync {
    fn is_known(&self, name: &str) -> bool;
}

/// The default resolver: only the tantivy built-ins plus any custom
/// analyzer definitions carried on the index definition resolve.
pub struct DefaultAnalyzerResolver {
    custom: Vec<String>,
}

impl DefaultAnalyzerResolver {
    pub fn new(custom: Vec<String>) -> Self {
        Self { custom }
    }
}

impl AnalyzerResolver for DefaultAnalyzerResolver {
    fn is_known(&self, name: &str) -> bool {
        BUILT_IN_ANALYZERS.contains(&name) || self.custom.iter().any(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryKind {
    FileSystem,
    MemoryMapped,
    Ram,
}

/// A custom analyzer definition; a filter chain applied on top of a
/// tokenizer. Validated to carry at least one filter (§4.9).
#[derive(Debug, Clone)]
pub struct AnalyzerDefinition {
    pub name: String,
    pub filters: Vec<String>,
}

/// A field as supplied by a caller, before validation.
#[derive(Debug, Clone)]
pub struct FieldInput {
    pub name: String,
    pub kind: FieldKind,
    pub stored_only: bool,
    pub index_analyzer: String,
    pub search_analyzer: String,
    pub postings: PostingsOptions,
    pub term_vectors: TermVectorOptions,
}

/// The user-supplied, unvalidated index definition (§6 `addIndex`).
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<FieldInput>,
    pub custom_analyzers: Vec<AnalyzerDefinition>,
    pub index_analyzer: String,
    pub search_analyzer: String,
    pub shard_count: usize,
    pub directory_kind: DirectoryKind,
    pub ram_buffer_mb: usize,
    pub commit_period_secs: u64,
    pub refresh_period_ms: u64,
    pub base_directory: std::path::PathBuf,
}

/// The validated, immutable setting an index runtime is built from (§3).
#[derive(Clone)]
pub struct IndexSetting {
    pub name: String,
    pub field_order: Vec<String>,
    pub fields: StdHashMap<String, Arc<FieldDescriptor>>,
    pub index_analyzer: String,
    pub search_analyzer: String,
    pub shard_count: usize,
    pub directory_kind: DirectoryKind,
    pub ram_buffer_mb: usize,
    pub commit_period_secs: u64,
    pub refresh_period_ms: u64,
    pub base_directory: std::path::PathBuf,
}

impl IndexSetting {
    pub fn field(&self, name: &str) -> Option<&Arc<FieldDescriptor>> {
        self.fields.get(name)
    }

    pub fn shard_path(&self, shard: usize) -> std::path::PathBuf {
        self.base_directory
            .join(&self.name)
            .join("shards")
            .join(shard.to_string())
    }

    pub fn index_root(&self) -> std::path::PathBuf {
        self.base_directory.join(&self.name)
    }
}

pub struct SettingsBuilder;

impl SettingsBuilder {
    /// Validates `definition` against `resolver`, producing an immutable
    /// [`IndexSetting`] or the first validation error encountered.
    pub fn build_setting(
        definition: &IndexDefinition,
        resolver: &dyn AnalyzerResolver,
    ) -> FlexResult<IndexSetting> {
        if definition.shard_count < 1 {
            return Err(FlexError::ValidationFailed("shard count must be >= 1".into()));
        }

        if !resolver.is_known(&definition.index_analyzer) {
            return Err(FlexError::ValidationFailed(format!(
                "index analyzer '{}' does not resolve",
                definition.index_analyzer
            )));
        }
        if !resolver.is_known(&definition.search_analyzer) {
            return Err(FlexError::ValidationFailed(format!(
                "search analyzer '{}' does not resolve",
                definition.search_analyzer
            )));
        }

        for analyzer in &definition.custom_analyzers {
            if analyzer.filters.is_empty() {
                return Err(FlexError::ValidationFailed(format!(
                    "custom analyzer '{}' must define at least one token filter",
                    analyzer.name
                )));
            }
        }

        let mut field_order = Vec::with_capacity(definition.fields.len());
        let mut fields = StdHashMap::with_capacity(definition.fields.len());

        for input in &definition.fields {
            if is_reserved(&input.name) {
                return Err(FlexError::ValidationFailed(format!(
                    "field name '{}' is reserved",
                    input.name
                )));
            }

            if !resolver.is_known(&input.index_analyzer) {
                return Err(FlexError::ValidationFailed(format!(
                    "field '{}' index analyzer '{}' does not resolve",
                    input.name, input.index_analyzer
                )));
            }
            if !resolver.is_known(&input.search_analyzer) {
                return Err(FlexError::ValidationFailed(format!(
                    "field '{}' search analyzer '{}' does not resolve",
                    input.name, input.search_analyzer
                )));
            }

            let descriptor = FieldDescriptor {
                name: input.name.clone(),
                kind: input.kind,
                stored_only: input.stored_only,
                index_analyzer: input.index_analyzer.clone(),
                search_analyzer: input.search_analyzer.clone(),
                postings: input.postings,
                term_vectors: input.term_vectors,
                value_source: None,
            };

            field_order.push(input.name.clone());
            fields.insert(input.name.clone(), Arc::new(descriptor));
        }

        Ok(IndexSetting {
            name: definition.name.clone(),
            field_order,
            fields,
            index_analyzer: definition.index_analyzer.clone(),
            search_analyzer: definition.search_analyzer.clone(),
            shard_count: definition.shard_count,
            directory_kind: definition.directory_kind.clone(),
            ram_buffer_mb: definition.ram_buffer_mb,
            commit_period_secs: definition.commit_period_secs,
            refresh_period_ms: definition.refresh_period_ms,
            base_directory: definition.base_directory.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_definition() -> IndexDefinition {
        IndexDefinition {
            name: "orders".into(),
            fields: vec![FieldInput {
                name: "body".into(),
                kind: FieldKind::Text,
                stored_only: false,
                index_analyzer: "default".into(),
                search_analyzer: "default".into(),
                postings: PostingsOptions::DocsAndFreqsAndPositions,
                term_vectors: TermVectorOptions::default(),
            }],
            custom_analyzers: vec![],
            index_analyzer: "default".into(),
            search_analyzer: "default".into(),
            shard_count: 4,
            directory_kind: DirectoryKind::Ram,
            ram_buffer_mb: 50,
            commit_period_secs: 30,
            refresh_period_ms: 25,
            base_directory: std::path::PathBuf::from("/tmp/flexsearch"),
        }
    }

    #[test]
    fn rejects_zero_shard_count() {
        let mut def = base_definition();
        def.shard_count = 0;
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        assert!(SettingsBuilder::build_setting(&def, &resolver).is_err());
    }

    #[test]
    fn rejects_reserved_field_name() {
        let mut def = base_definition();
        def.fields.push(FieldInput {
            name: "id".into(),
            kind: FieldKind::Text,
            stored_only: false,
            index_analyzer: "default".into(),
            search_analyzer: "default".into(),
            postings: PostingsOptions::Basic,
            term_vectors: TermVectorOptions::default(),
        });
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        assert!(SettingsBuilder::build_setting(&def, &resolver).is_err());
    }

    #[test]
    fn rejects_custom_analyzer_with_no_filters() {
        let mut def = base_definition();
        def.custom_analyzers.push(AnalyzerDefinition {
            name: "custom1".into(),
            filters: vec![],
        });
        let resolver = DefaultAnalyzerResolver::new(vec!["custom1".into()]);
        assert!(SettingsBuilder::build_setting(&def, &resolver).is_err());
    }

    #[test]
    fn accepts_valid_definition() {
        let def = base_definition();
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        let setting = SettingsBuilder::build_setting(&def, &resolver).unwrap();
        assert_eq!(setting.shard_count, 4);
        assert!(setting.field("body").is_some());
    }
}

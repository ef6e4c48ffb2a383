//! Write pipeline (C5).
//!
//! Serializes a bounded, ordered command stream into shard writers,
//! enforcing optimistic-concurrency versioning and reusing per-worker,
//! per-index document templates so a write never allocates a fresh
//! document object. N actor threads pull from one shared bounded queue,
//! matching §5's "single-writer cooperative worker with configurable
//! maximum parallelism".

use std::cell::RefCell;
use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use chrono::Utc;
use crossbeam::channel;
use hashbrown::HashMap;
use tantivy::schema::{Field, Schema};
use tantivy::{Document as TantivyDocument, Term};

use crate::error::FlexError;
use crate::field::{self, Cell, CellValue, FieldDescriptor};
use crate::runtime::{IndexLookup, IndexRuntime};
use crate::versioning::VersioningCache;

/// A single pipeline command targeting one index (§4.5).
#[derive(Debug, Clone)]
pub enum Command {
    Create(String, HashMap<String, String>),
    Update(String, HashMap<String, String>),
    Delete(String),
    DeleteByIndex,
    Commit,
}

/// `(index name, command)`, the unit the pipeline's bounded queue carries.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub index_name: String,
    pub command: Command,
}

/// The result of applying one command: user-visible, never a panic/abort
/// (§7 propagation).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub ok: bool,
    pub message: String,
}

impl CommandResult {
    fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

type Job = (WriteCommand, std::sync::mpsc::SyncSender<CommandResult>);

/// Per-worker, per-index cached document template (§4.5). Confined to the
/// producing worker thread; never observed by another worker (invariant 3).
struct DocumentTemplate {
    doc: TantivyDocument,
    id_field: Field,
    type_field: Field,
    lastmodified_field: Field,
    version_field: Field,
    cells: StdHashMap<String, (Arc<FieldDescriptor>, Field, Cell)>,
}

impl DocumentTemplate {
    fn new(schema: &Schema, fields: &StdHashMap<String, Arc<FieldDescriptor>>) -> Self {
        let mut cells = StdHashMap::with_capacity(fields.len());
        for (name, descriptor) in fields {
            if let Some(tantivy_field) = schema.get_field(name) {
                cells.insert(
                    name.to_ascii_lowercase(),
                    (descriptor.clone(), tantivy_field, field::create_cell(descriptor)),
                );
            }
        }

        Self {
            doc: TantivyDocument::new(),
            id_field: schema.get_field("id").expect("reserved field"),
            type_field: schema.get_field("type").expect("reserved field"),
            lastmodified_field: schema.get_field("lastmodified").expect("reserved field"),
            version_field: schema.get_field("version").expect("reserved field"),
            cells,
        }
    }

    /// Writes `id`, `lastmodified`, `version` and every non-reserved field
    /// into the cached document, resetting any field not present in
    /// `inputs` to its default (§4.5 step 1-2).
    fn populate(&mut self, index_name: &str, id: &str, version: i32, inputs: &HashMap<String, String>) {
        self.doc = TantivyDocument::new();
        self.doc.add_text(self.id_field, id);
        self.doc.add_text(self.type_field, index_name);
        self.doc.add_i64(self.lastmodified_field, Utc::now().timestamp_millis());
        self.doc.add_i64(self.version_field, version as i64);

        for (descriptor, tantivy_field, cell) in self.cells.values_mut() {
            let lowered = descriptor.name.to_ascii_lowercase();
            match (descriptor.value_source.as_ref(), inputs.get(&lowered).or_else(|| inputs.get(&descriptor.name))) {
                (Some(source), _) => {
                    let computed = source(inputs);
                    if field::write_cell(descriptor, cell, &computed).is_err() {
                        field::write_default(descriptor, cell);
                    }
                }
                (None, Some(value)) => {
                    if field::write_cell(descriptor, cell, value).is_err() {
                        field::write_default(descriptor, cell);
                    }
                }
                (None, None) => field::write_default(descriptor, cell),
            }

            write_into_document(&mut self.doc, *tantivy_field, cell);
        }
    }

    fn finish(&mut self) -> TantivyDocument {
        std::mem::replace(&mut self.doc, TantivyDocument::new())
    }
}

fn write_into_document(doc: &mut TantivyDocument, field: Field, cell: &Cell) {
    match &cell.value {
        CellValue::Text(s) => doc.add_text(field, s),
        CellValue::Int(v) => doc.add_i64(field, *v),
        CellValue::Long(v) => doc.add_i64(field, *v),
        CellValue::Double(v) => doc.add_f64(field, *v),
        CellValue::Bool(v) => doc.add_u64(field, if *v { 1 } else { 0 }),
        CellValue::DateTime(dt) => doc.add_i64(field, dt.timestamp_millis()),
    }
}

thread_local! {
    static TEMPLATES: RefCell<StdHashMap<String, DocumentTemplate>> = RefCell::new(StdHashMap::new());
}

/// The bounded, ordered command stream served by a fixed pool of worker
/// threads (default: one per logical CPU, bounded capacity 1000; §4.5,
/// §5). Each worker confines its document templates to itself.
pub struct WritePipeline {
    sender: channel::Sender<Job>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl WritePipeline {
    pub fn new(lookup: Arc<dyn IndexLookup>, versioning: Arc<VersioningCache>) -> Self {
        Self::with_config(lookup, versioning, num_cpus::get().max(1), 1000)
    }

    pub fn with_config(
        lookup: Arc<dyn IndexLookup>,
        versioning: Arc<VersioningCache>,
        parallelism: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = channel::bounded::<Job>(capacity);

        let workers = (0..parallelism.max(1))
            .map(|n| {
                let rx = rx.clone();
                let lookup = lookup.clone();
                let versioning = versioning.clone();
                std::thread::Builder::new()
                    .name(format!("write-pipeline-{}", n))
                    .spawn(move || worker_loop(rx, lookup, versioning))
                    .expect("spawn write pipeline worker")
            })
            .collect();

        Self {
            sender: tx,
            _workers: workers,
        }
    }

    /// Submits a command and blocks the calling async task (via
    /// `spawn_blocking`-free channel recv) until it's applied. Items beyond
    /// the bounded capacity apply backpressure on the caller (§4.5).
    pub async fn submit(&self, cmd: WriteCommand) -> CommandResult {
        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        let sender = self.sender.clone();
        let job = (cmd, reply_tx);

        let send_result = tokio::task::spawn_blocking(move || sender.send(job)).await;
        if send_result.is_err() {
            return CommandResult::err("write pipeline has shut down");
        }

        match tokio::task::spawn_blocking(move || reply_rx.recv()).await {
            Ok(Ok(result)) => result,
            _ => CommandResult::err("write pipeline worker dropped the reply channel"),
        }
    }

    /// Fire-and-forget submission with an explicit reply channel
    /// (`performCommandAsync`, §6).
    pub fn submit_async(&self, cmd: WriteCommand, reply: std::sync::mpsc::SyncSender<CommandResult>) {
        let _ = self.sender.send((cmd, reply));
    }
}

fn worker_loop(rx: channel::Receiver<Job>, lookup: Arc<dyn IndexLookup>, versioning: Arc<VersioningCache>) {
    while let Ok((cmd, reply)) = rx.recv() {
        let result = handle_command(&cmd, &lookup, &versioning);
        let _ = reply.send(result);
    }
}

fn handle_command(cmd: &WriteCommand, lookup: &Arc<dyn IndexLookup>, versioning: &Arc<VersioningCache>) -> CommandResult {
    let runtime = match lookup.get_online(&cmd.index_name) {
        Some(r) => r,
        None => return CommandResult::err(format!("index '{}' is not online", cmd.index_name)),
    };

    match &cmd.command {
        Command::Create(id, fields) => handle_create(&runtime, versioning, id, fields),
        Command::Update(id, fields) => handle_update(&runtime, versioning, id, fields),
        Command::Delete(id) => handle_delete(&runtime, versioning, id),
        Command::DeleteByIndex => handle_delete_by_index(&runtime),
        Command::Commit => handle_commit(&runtime),
    }
}

fn with_template<R>(runtime: &IndexRuntime, f: impl FnOnce(&mut DocumentTemplate) -> R) -> R {
    TEMPLATES.with(|cache| {
        let mut cache = cache.borrow_mut();
        let template = cache
            .entry(runtime.setting.name.to_ascii_lowercase())
            .or_insert_with(|| DocumentTemplate::new(runtime.shards[0].schema(), &runtime.setting.fields));
        f(template)
    })
}

fn handle_create(
    runtime: &IndexRuntime,
    versioning: &Arc<VersioningCache>,
    id: &str,
    fields: &HashMap<String, String>,
) -> CommandResult {
    if id.is_empty() {
        return CommandResult::err(FlexError::MissingId.to_string());
    }

    versioning.add(&runtime.setting.name, id, 1);

    let doc = with_template(runtime, |t| {
        t.populate(&runtime.setting.name, id, 1, fields);
        t.finish()
    });

    let shard = runtime.shard_for(id);
    match shard.add_blocking(doc) {
        Ok(()) => CommandResult::ok(),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

fn handle_update(
    runtime: &IndexRuntime,
    versioning: &Arc<VersioningCache>,
    id: &str,
    fields: &HashMap<String, String>,
) -> CommandResult {
    if id.is_empty() {
        return CommandResult::err(FlexError::MissingId.to_string());
    }

    let shard = runtime.shard_for(id);
    let id_field = shard.schema().get_field("id").expect("reserved field");
    let version_field = shard.schema().get_field("version").expect("reserved field");

    if let Some(entry) = versioning.get(&runtime.setting.name, id) {
        let new_version = entry.version + 1;
        if !versioning.update(&runtime.setting.name, id, entry.version, entry.last_update, new_version) {
            return CommandResult::err(FlexError::VersionMismatch(id.to_string()).to_string());
        }

        let doc = with_template(runtime, |t| {
            t.populate(&runtime.setting.name, id, new_version, fields);
            t.finish()
        });

        return match shard.update_blocking(Term::from_field_text(id_field, id), doc) {
            Ok(()) => CommandResult::ok(),
            Err(e) => CommandResult::err(e.to_string()),
        };
    }

    // Cache miss: point-query the index for the current stored version.
    let stored_version = point_query_version(runtime, id, id_field, version_field);
    match stored_version {
        None => handle_create(runtime, versioning, id, fields),
        Some(current) => {
            let new_version = current + 1;
            versioning.add(&runtime.setting.name, id, new_version);

            let doc = with_template(runtime, |t| {
                t.populate(&runtime.setting.name, id, new_version, fields);
                t.finish()
            });

            // Open question (b): always prefer updateDocument(Term) over
            // addDocument so a present-but-uncached id never duplicates.
            match shard.update_blocking(Term::from_field_text(id_field, id), doc) {
                Ok(()) => CommandResult::ok(),
                Err(e) => CommandResult::err(e.to_string()),
            }
        }
    }
}

fn point_query_version(runtime: &IndexRuntime, id: &str, id_field: Field, version_field: Field) -> Option<i32> {
    use tantivy::collector::TopDocs;
    use tantivy::query::TermQuery;
    use tantivy::schema::IndexRecordOption;

    let shard = runtime.shard_for(id);
    let handle = shard.acquire_searcher();
    let query = TermQuery::new(Term::from_field_text(id_field, id), IndexRecordOption::Basic);
    let top = handle.searcher.search(&query, &TopDocs::with_limit(1)).ok()?;
    let result = top.first().and_then(|(_, addr)| {
        let doc = handle.searcher.doc(*addr).ok()?;
        doc.get_first(version_field).and_then(|v| v.i64_value()).map(|v| v as i32)
    });
    shard.release_searcher(handle);
    result
}

fn handle_delete(runtime: &IndexRuntime, versioning: &Arc<VersioningCache>, id: &str) -> CommandResult {
    if id.is_empty() {
        return CommandResult::err(FlexError::MissingId.to_string());
    }

    versioning.delete(&runtime.setting.name, id);

    // Corrected per §4.5/§9: route with shard_of(id, N), not shard_of - 1.
    let shard = runtime.shard_for(id);
    let id_field = shard.schema().get_field("id").expect("reserved field");

    match shard.delete_blocking(Term::from_field_text(id_field, id)) {
        Ok(()) => CommandResult::ok(),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

fn handle_delete_by_index(runtime: &IndexRuntime) -> CommandResult {
    for shard in &runtime.shards {
        if let Err(e) = shard.delete_all_blocking() {
            return CommandResult::err(e.to_string());
        }
    }
    CommandResult::ok()
}

fn handle_commit(runtime: &IndexRuntime) -> CommandResult {
    for shard in &runtime.shards {
        if let Err(e) = shard.commit_blocking() {
            return CommandResult::err(e.to_string());
        }
    }
    CommandResult::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::IndexRuntime;
    use crate::schema::build_schema;
    use crate::settings::{DefaultAnalyzerResolver, DirectoryKind, FieldInput, IndexDefinition, SettingsBuilder};
    use crate::field::{FieldKind, PostingsOptions, TermVectorOptions};
    use crate::shard::Shard;
    use tokio_util::sync::CancellationToken;

    struct FixedLookup(Arc<IndexRuntime>);
    impl IndexLookup for FixedLookup {
        fn get_online(&self, name: &str) -> Option<Arc<IndexRuntime>> {
            if name.eq_ignore_ascii_case(&self.0.setting.name) {
                Some(self.0.clone())
            } else {
                None
            }
        }
    }

    fn build_runtime(shard_count: usize) -> Arc<IndexRuntime> {
        let def = IndexDefinition {
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
            shard_count,
            directory_kind: DirectoryKind::Ram,
            ram_buffer_mb: 15,
            commit_period_secs: 30,
            refresh_period_ms: 25,
            base_directory: std::path::PathBuf::from("/tmp/flexsearch-pipeline-test"),
        };
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        let setting = SettingsBuilder::build_setting(&def, &resolver).unwrap();
        let schema = build_schema(&setting);

        let shards = (0..shard_count)
            .map(|n| Arc::new(Shard::open(&setting, schema.clone(), n, std::path::Path::new("unused")).unwrap()))
            .collect();

        Arc::new(IndexRuntime {
            setting,
            shards,
            cancellation: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn create_then_k_updates_leaves_version_k_plus_1() {
        let runtime = build_runtime(1);
        let versioning = VersioningCache::new();
        let lookup: Arc<dyn IndexLookup> = Arc::new(FixedLookup(runtime.clone()));
        let pipeline = WritePipeline::with_config(lookup, versioning.clone(), 1, 10);

        let mut fields = HashMap::new();
        fields.insert("body".to_string(), "hello".to_string());

        let res = pipeline
            .submit(WriteCommand {
                index_name: "orders".into(),
                command: Command::Create("doc-1".into(), fields.clone()),
            })
            .await;
        assert!(res.ok, "{}", res.message);

        for _ in 0..3 {
            let res = pipeline
                .submit(WriteCommand {
                    index_name: "orders".into(),
                    command: Command::Update("doc-1".into(), fields.clone()),
                })
                .await;
            assert!(res.ok, "{}", res.message);
        }

        assert_eq!(versioning.get("orders", "doc-1").unwrap().version, 4);
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let runtime = build_runtime(1);
        let versioning = VersioningCache::new();
        let lookup: Arc<dyn IndexLookup> = Arc::new(FixedLookup(runtime));
        let pipeline = WritePipeline::with_config(lookup, versioning, 1, 10);

        let res = pipeline
            .submit(WriteCommand {
                index_name: "orders".into(),
                command: Command::Create("".into(), HashMap::new()),
            })
            .await;

        assert!(!res.ok);
        assert_eq!(res.message, FlexError::MissingId.to_string());
    }

    #[test]
    fn update_cas_loser_reports_canonical_version_mismatch() {
        let runtime = build_runtime(1);
        let versioning = VersioningCache::new();
        let mut fields = HashMap::new();
        fields.insert("body".to_string(), "hello".to_string());

        let create = handle_create(&runtime, &versioning, "doc-1", &fields);
        assert!(create.ok, "{}", create.message);

        // Snapshot the entry before a writer commits, the way a concurrent
        // caller's own read would race against it.
        let stale_entry = versioning.get("orders", "doc-1").unwrap();

        let update = handle_update(&runtime, &versioning, "doc-1", &fields);
        assert!(update.ok, "{}", update.message);

        // A second writer CAS-ing off the pre-update snapshot loses exactly
        // the way handle_update's own mismatch branch does, and the message
        // it would report is the canonical FlexError variant, not an ad hoc
        // string literal.
        let won = versioning.update(
            "orders",
            "doc-1",
            stale_entry.version,
            stale_entry.last_update,
            stale_entry.version + 1,
        );
        assert!(!won);
        assert_eq!(
            FlexError::VersionMismatch("doc-1".to_string()).to_string(),
            "version mismatch for document 'doc-1'"
        );
    }
}

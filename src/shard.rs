//! Shard (C2).
//!
//! Owns one writer actor, one searcher manager (a tantivy `IndexReader` in
//! manual-reload mode) and one reopen worker for a fraction of an index. A
//! single-writer-thread actor pair handles create/update/delete/commit, and
//! an explicit NRT reopen worker refreshes visibility on a timer instead of
//! on every commit.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use crossbeam::channel;
use crossbeam::queue::SegQueue;
use tantivy::schema::Schema;
use tantivy::{Document, Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::settings::{DirectoryKind, IndexSetting};

/// A writing operation to be sent to the [`IndexWriterWorker`].
#[derive(Debug)]
enum WriterOp {
    Add(Document),
    Update(Term, Document),
    DeleteTerm(Term),
    DeleteAll,
    Commit,
    __Shutdown,
}

/// A background task applying write operations to a single shard's writer,
/// in submission order. One thread per shard (§5 single-writer worker).
struct IndexWriterWorker {
    shard_label: String,
    writer: IndexWriter,
    generation: Arc<AtomicU64>,
    dirty: Arc<AtomicBool>,
    waiters: Arc<SegQueue<oneshot::Sender<()>>>,
    rx: channel::Receiver<WriterOp>,
}

impl IndexWriterWorker {
    fn start(mut self) {
        loop {
            if self.process_messages() {
                break;
            }
            while let Some(waiter) = self.waiters.pop() {
                let _ = waiter.send(());
            }
        }
        while let Some(waiter) = self.waiters.pop() {
            let _ = waiter.send(());
        }
    }

    fn process_messages(&mut self) -> bool {
        while let Ok(msg) = self.rx.try_recv() {
            match self.handle_msg(msg) {
                Err(e) => error!(
                    "[ WRITER @ {} ] failed handling writer operation due to error: {:?}",
                    &self.shard_label, e,
                ),
                Ok(true) => return true,
                _ => {}
            }
        }
        false
    }

    fn handle_msg(&mut self, op: WriterOp) -> Result<bool> {
        let (stamp, label) = match op {
            WriterOp::__Shutdown => return Ok(true),
            WriterOp::Commit => {
                let stamp = self.writer.commit()?;
                self.dirty.store(false, Ordering::SeqCst);
                (stamp, "COMMIT")
            }
            WriterOp::Add(doc) => (self.writer.add_document(doc), "ADD"),
            WriterOp::Update(term, doc) => {
                self.writer.delete_term(term);
                (self.writer.add_document(doc), "UPDATE")
            }
            WriterOp::DeleteAll => (self.writer.delete_all_documents()?, "DELETE-ALL"),
            WriterOp::DeleteTerm(term) => (self.writer.delete_term(term), "DELETE-TERM"),
        };

        if label != "COMMIT" {
            self.dirty.store(true, Ordering::SeqCst);
        }
        self.generation.store(stamp, Ordering::SeqCst);

        info!(
            "[ WRITER @ {} ][ {} ] completed operation {}",
            &self.shard_label, stamp, label
        );

        Ok(false)
    }
}

/// Wrapper handler around a bounded queue and the writer worker thread.
struct IndexWriterHandler {
    shard_label: String,
    _writer_thread: std::thread::JoinHandle<()>,
    waiters: Arc<SegQueue<oneshot::Sender<()>>>,
    sender: channel::Sender<WriterOp>,
    generation: Arc<AtomicU64>,
    dirty: Arc<AtomicBool>,
}

impl IndexWriterHandler {
    fn create(shard_label: String, writer: IndexWriter) -> Self {
        let name = shard_label.clone();
        let waiters = Arc::new(SegQueue::new());
        let generation = Arc::new(AtomicU64::new(0));
        let dirty = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded(1000);

        let worker = IndexWriterWorker {
            shard_label: shard_label.clone(),
            writer,
            generation: generation.clone(),
            dirty: dirty.clone(),
            waiters: waiters.clone(),
            rx,
        };

        let handle = std::thread::Builder::new()
            .name(format!("shard-writer-{}", &shard_label))
            .spawn(move || {
                info!("[ WRITER @ {} ] writer thread started", name);
                worker.start()
            })
            .expect("spawn shard writer thread");

        Self {
            shard_label,
            _writer_thread: handle,
            waiters,
            sender: tx,
            generation,
            dirty,
        }
    }

    async fn send_op(&self, op: WriterOp) -> Result<()> {
        let mut op = op;
        loop {
            op = match self.sender.try_send(op) {
                Ok(()) => return Ok(()),
                Err(channel::TrySendError::Disconnected(_)) => {
                    return Err(Error::msg("shard writer has shut down"))
                }
                Err(channel::TrySendError::Full(v)) => v,
            };

            debug!(
                "[ WRITER @ {} ] operation queue full, waiting for wakeup",
                &self.shard_label
            );

            let (resolve, waiter) = oneshot::channel();
            self.waiters.push(resolve);
            let _ = waiter.await;
        }
    }

    fn shutdown(&self) {
        let _ = self.sender.send(WriterOp::__Shutdown);
    }

    /// Blocking variant of [`send_op`], for use from the write pipeline's
    /// dedicated OS-thread workers (§4.5, §5) where there is no executor to
    /// await a wakeup on.
    fn send_op_blocking(&self, op: WriterOp) -> Result<()> {
        self.sender
            .send(op)
            .map_err(|_| Error::msg("shard writer has shut down"))
    }
}

/// A reference-counted handle to a leased searcher.
///
/// Acquire/release is an RAII pair: dropping the handle is the release, so
/// every exit path — including early returns on error — releases exactly
/// once without the caller needing to remember to do so (§4.2 guarantee).
pub struct SearcherHandle {
    pub searcher: tantivy::LeasedItem<tantivy::Searcher>,
    outstanding: Arc<AtomicU64>,
}

impl Drop for SearcherHandle {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One horizontal partition of an index: its own tantivy writer and reader.
pub struct Shard {
    pub shard_number: usize,
    schema: Schema,
    index: Index,
    writer: IndexWriterHandler,
    reader: IndexReader,
    outstanding_searchers: Arc<AtomicU64>,
    stale_tolerance: Duration,
}

impl Shard {
    /// Opens (creating if absent) the tantivy index backing this shard.
    pub fn open(
        setting: &IndexSetting,
        schema: Schema,
        shard_number: usize,
        path: &Path,
    ) -> Result<Self> {
        let index = match setting.directory_kind {
            DirectoryKind::Ram => Index::create_in_ram(schema.clone()),
            DirectoryKind::FileSystem | DirectoryKind::MemoryMapped => {
                std::fs::create_dir_all(path)?;
                if Index::exists(&tantivy::directory::MmapDirectory::open(path)?)? {
                    Index::open_in_dir(path)?
                } else {
                    Index::create_in_dir(path, schema.clone())?
                }
            }
        };

        let writer_threads = num_cpus::get().max(1);
        let writer = index.writer_with_num_threads(
            writer_threads,
            (setting.ram_buffer_mb * 1_000_000).max(15_000_000),
        )?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let shard_label = format!("{}-{}", setting.name, shard_number);

        Ok(Self {
            shard_number,
            schema,
            index,
            writer: IndexWriterHandler::create(shard_label, writer),
            reader,
            outstanding_searchers: Arc::new(AtomicU64::new(0)),
            stale_tolerance: Duration::from_millis(
                setting.refresh_period_ms.clamp(5, 25).max(5),
            ),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub async fn add(&self, doc: Document) -> Result<()> {
        self.writer.send_op(WriterOp::Add(doc)).await
    }

    pub async fn update(&self, term: Term, doc: Document) -> Result<()> {
        self.writer.send_op(WriterOp::Update(term, doc)).await
    }

    pub async fn delete(&self, term: Term) -> Result<()> {
        self.writer.send_op(WriterOp::DeleteTerm(term)).await
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.writer.send_op(WriterOp::DeleteAll).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.writer.send_op(WriterOp::Commit).await
    }

    pub fn add_blocking(&self, doc: Document) -> Result<()> {
        self.writer.send_op_blocking(WriterOp::Add(doc))
    }

    pub fn update_blocking(&self, term: Term, doc: Document) -> Result<()> {
        self.writer.send_op_blocking(WriterOp::Update(term, doc))
    }

    pub fn delete_blocking(&self, term: Term) -> Result<()> {
        self.writer.send_op_blocking(WriterOp::DeleteTerm(term))
    }

    pub fn delete_all_blocking(&self) -> Result<()> {
        self.writer.send_op_blocking(WriterOp::DeleteAll)
    }

    pub fn commit_blocking(&self) -> Result<()> {
        self.writer.send_op_blocking(WriterOp::Commit)
    }

    /// Commits only if the shard has buffered, unflushed changes. Used by
    /// the scheduled commit loop (§4.6) to avoid redundant commits.
    pub async fn commit_if_dirty(&self) -> Result<()> {
        if self.writer.dirty.load(Ordering::SeqCst) {
            self.commit().await
        } else {
            Ok(())
        }
    }

    /// Refreshes the searcher if it's stale by more than the target
    /// tolerance. Visibility to readers only happens after this call
    /// (NRT semantics, §4.2, §5).
    pub fn maybe_refresh(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    pub fn acquire_searcher(&self) -> SearcherHandle {
        self.outstanding_searchers.fetch_add(1, Ordering::SeqCst);
        SearcherHandle {
            searcher: self.reader.searcher(),
            outstanding: self.outstanding_searchers.clone(),
        }
    }

    pub fn release_searcher(&self, handle: SearcherHandle) {
        drop(handle);
    }

    pub fn generation(&self) -> u64 {
        self.writer.generation.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.writer.dirty.load(Ordering::SeqCst)
    }

    pub fn stale_tolerance(&self) -> Duration {
        self.stale_tolerance
    }

    /// Commits outstanding changes then shuts the writer thread down.
    pub async fn close(&self) -> Result<()> {
        self.commit().await?;
        self.writer.shutdown();
        Ok(())
    }
}

/// Spawns the NRT reopen worker for one shard: sleeps for the shard's
/// refresh period and calls `maybe_refresh`, until `token` is cancelled.
///
/// Holds only a weak back-reference to its shard (via `std::sync::Weak`) —
/// ownership flows the other way, from the index runtime down through its
/// shards (§9 design notes).
pub fn spawn_reopen_worker(
    shard: std::sync::Weak<Shard>,
    refresh_period: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(refresh_period) => {}
            }

            match shard.upgrade() {
                Some(shard) => {
                    if let Err(e) = shard.maybe_refresh() {
                        warn!("reopen worker failed to refresh shard {}: {:?}", shard.shard_number, e);
                    }
                }
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{FieldInput, IndexDefinition, SettingsBuilder};
    use crate::field::{FieldKind, PostingsOptions, TermVectorOptions};
    use crate::settings::DefaultAnalyzerResolver;
    use tantivy::schema::{SchemaBuilder, STORED, TEXT};

    fn ram_setting() -> IndexSetting {
        let def = IndexDefinition {
            name: "t".into(),
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
            shard_count: 1,
            directory_kind: DirectoryKind::Ram,
            ram_buffer_mb: 15,
            commit_period_secs: 30,
            refresh_period_ms: 25,
            base_directory: std::path::PathBuf::from("/tmp/flexsearch-test"),
        };
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        SettingsBuilder::build_setting(&def, &resolver).unwrap()
    }

    fn schema_with_body() -> Schema {
        let mut builder: SchemaBuilder = Schema::builder();
        builder.add_text_field("body", TEXT | STORED);
        builder.build()
    }

    #[tokio::test]
    async fn add_is_invisible_until_refresh() {
        let setting = ram_setting();
        let schema = schema_with_body();
        let shard = Shard::open(&setting, schema.clone(), 0, Path::new("unused")).unwrap();

        let field = schema.get_field("body").unwrap();
        let mut doc = Document::new();
        doc.add_text(field, "hello world");
        shard.add(doc).await.unwrap();
        shard.commit().await.unwrap();

        let handle = shard.acquire_searcher();
        assert_eq!(handle.searcher.num_docs(), 0, "not visible before refresh");
        shard.release_searcher(handle);

        shard.maybe_refresh().unwrap();
        let handle = shard.acquire_searcher();
        assert_eq!(handle.searcher.num_docs(), 1);
        shard.release_searcher(handle);
    }

    #[tokio::test]
    async fn commit_if_dirty_is_noop_when_clean() {
        let setting = ram_setting();
        let schema = schema_with_body();
        let shard = Shard::open(&setting, schema, 0, Path::new("unused")).unwrap();
        assert!(!shard.is_dirty());
        shard.commit_if_dirty().await.unwrap();
    }
}

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::{BoxFuture, join, join_all};
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{Instrument, Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Blake3Hasher, Dynamic, Hash32};
use crate::engine::registry::Slot;
use crate::engine::{
    BuildGraph, Diagnostics, Entry, FileMeta, Handle, Journal, NodeRef, TaskContext,
    TaskExecution, TaskKind, Target,
};
use crate::error::{KarakuriError, TaskError};

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of external processes running at once.
    pub jobs: usize,
    /// Stop starting new recipes once anything failed.
    pub fail_fast: bool,
    /// Drop journal entries of nodes not in the graph after a successful run.
    pub prune: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            fail_fast: false,
            prune: false,
        }
    }
}

#[derive(Clone)]
struct Done {
    output: Dynamic,
    stamp: Hash32,
}

type Outcome = Result<Done, Arc<TaskError>>;

/// Outputs of the requested roots.
#[derive(Debug)]
pub struct Outputs {
    values: HashMap<NodeIndex, Dynamic>,
}

impl Outputs {
    pub fn get<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> Option<&T> {
        self.values.get(&handle.index)?.downcast_ref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Executes a [`BuildGraph`] on demand.
///
/// Each node owns a once-cell: the first caller to resolve a node runs it,
/// every concurrent or later caller attaches to the same result. A node first
/// resolves all of its needs concurrently, then derives its signature from
/// its recipe identity and the stamps of those needs. If the journal holds an
/// entry under the same signature (and, for files, the artifact on disk is
/// still the one recorded) the stored output is reused; otherwise the recipe
/// runs and its result is journaled.
pub struct Runner<'g, G: Send + Sync + 'static> {
    graph: &'g BuildGraph<G>,
    cells: Vec<OnceCell<Outcome>>,
    journal: Mutex<Journal>,
    jobs: Semaphore,
    options: RunOptions,
    stopping: AtomicBool,
    run_id: Hash32,
    report: Mutex<Diagnostics>,
}

impl<'g, G: Send + Sync + 'static> Runner<'g, G> {
    pub fn new(graph: &'g BuildGraph<G>, journal: Journal, options: RunOptions) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        Self {
            graph,
            cells: (0..graph.len()).map(|_| OnceCell::new()).collect(),
            journal: Mutex::new(journal),
            jobs: Semaphore::new(options.jobs.max(1)),
            options,
            stopping: AtomicBool::new(false),
            run_id: Hash32::hash(nanos.to_le_bytes()),
            report: Mutex::new(Diagnostics::default()),
        }
    }

    /// Builds the given roots and everything they need.
    ///
    /// Independent branches keep going when something fails; the error lists
    /// every failure that originated in a node (not the ones inherited by
    /// dependents).
    pub async fn run(&self, roots: &[NodeRef]) -> Result<Outputs, KarakuriError> {
        let total = self.graph.closure(roots).len() as u64;

        let root_span = tracing::span!(Level::INFO, "building_tasks");
        root_span.pb_set_length(total);
        root_span.pb_set_style(&bar_style());
        root_span.pb_set_message("Building tasks...");

        // Nodes report progress to whichever span is current, which is this
        // one while resolving needs.
        let outcomes = join_all(roots.iter().map(|root| self.resolve(root.0)))
            .instrument(root_span)
            .await;

        let mut values = HashMap::new();
        let mut failed = false;

        for (root, outcome) in roots.iter().zip(outcomes) {
            match outcome {
                Ok(done) => {
                    values.insert(root.0, done.output);
                }
                Err(_) => failed = true,
            }
        }

        if failed {
            let origins = self.lock_report().origins();
            tracing::error!("Build failed: {}", self.lock_report().summary());
            return Err(KarakuriError::Failed(origins));
        }

        if self.options.prune {
            let removed = self.lock_journal().prune(self.graph.keys())?;
            if removed > 0 {
                tracing::info!("Pruned {removed} stale journal entries");
            }
        }

        tracing::info!("Build complete! {}", self.lock_report().summary());
        Ok(Outputs { values })
    }

    /// Consumes the runner, returning the journal and what happened.
    pub fn finish(self) -> (Journal, Diagnostics) {
        let journal = self
            .journal
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let report = self
            .report
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (journal, report)
    }

    /// Snapshot of the diagnostics so far.
    pub fn diagnostics(&self) -> MutexGuard<'_, Diagnostics> {
        self.lock_report()
    }

    fn resolve(&self, index: NodeIndex) -> BoxFuture<'_, Outcome> {
        async move {
            self.cells[index.index()]
                .get_or_init(|| self.compute(index))
                .await
                .clone()
        }
        .boxed()
    }

    async fn compute(&self, index: NodeIndex) -> Outcome {
        let slot = &self.graph.graph[index];
        let outcome = self.compute_slot(index, slot).await;

        Span::current().pb_inc(1);
        if let Err(e) = &outcome {
            self.lock_report().failed.insert(index, e.clone());
            if e.is_origin() {
                tracing::error!("{e}");
                if self.options.fail_fast {
                    self.stopping.store(true, Ordering::SeqCst);
                }
            }
        }

        outcome
    }

    async fn compute_slot(&self, index: NodeIndex, slot: &Slot<G>) -> Outcome {
        let Some(task) = slot.task.as_ref() else {
            return Err(Arc::new(TaskError::Contract(
                slot.label.clone(),
                "node was never fully declared".into(),
            )));
        };

        let (needs, after) = join(
            join_all(slot.needs.iter().map(|&need| self.resolve(need))),
            join_all(slot.after.iter().map(|&need| self.resolve(need))),
        )
        .await;

        let mut outputs = Vec::with_capacity(needs.len());
        let mut hasher = Blake3Hasher::new();
        hasher.digest(slot.fingerprint);

        for (i, outcome) in needs.into_iter().enumerate() {
            let done = self.require(slot, slot.needs[i], outcome)?;
            hasher.digest(done.stamp);
            outputs.push(done.output);
        }

        hasher.chunk("after");
        for (i, outcome) in after.into_iter().enumerate() {
            let done = self.require(slot, slot.after[i], outcome)?;
            hasher.digest(done.stamp);
        }

        let signature = hasher.finish32();

        if task.cached()
            && let Some(done) = self.reuse(slot, signature).await
        {
            tracing::debug!("{} is up to date", slot.label);
            self.lock_report().reused.push(index);
            return Ok(done);
        }

        if self.stopping.load(Ordering::SeqCst) {
            return Err(Arc::new(TaskError::Aborted(slot.label.clone())));
        }

        let span = tracing::span!(Level::INFO, "task", name = slot.label.as_str());
        span.pb_set_style(&task_style());
        span.pb_set_message(&format!("Running {}", slot.label));

        let cx = TaskContext {
            env: self.graph.env(),
            jobs: &self.jobs,
            label: &slot.label,
            span: span.clone(),
        };

        let start = Instant::now();

        // A panicking recipe only owns its own future, so nothing it leaves
        // behind is observed by other nodes.
        let result = AssertUnwindSafe(task.execute(&cx, &outputs))
            .catch_unwind()
            .instrument(span)
            .await;

        let duration = start.elapsed();

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Arc::new(TaskError::Recipe(slot.label.clone(), e))),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };
                return Err(Arc::new(TaskError::Panic(slot.label.clone(), msg)));
            }
        };

        self.lock_report()
            .execution_times
            .insert(index, TaskExecution { start, duration });

        let (stamp, file) = self.stamp(slot, signature, &output).await?;

        if task.cached() {
            let bytes = task
                .encode(&output)
                .map_err(|e| Arc::new(TaskError::Recipe(slot.label.clone(), e)))?;

            let entry = Entry {
                key: slot.key.canonical().to_string(),
                signature,
                stamp,
                output: bytes,
                file,
            };

            // Losing an entry only costs a rebuild next time.
            if let Err(e) = self.lock_journal().record(entry) {
                tracing::warn!("Couldn't journal {}: {e}", slot.label);
            }
        }

        Ok(Done { output, stamp })
    }

    fn require(&self, slot: &Slot<G>, need: NodeIndex, outcome: Outcome) -> Outcome {
        outcome.map_err(|_| {
            Arc::new(TaskError::Dependency {
                node: slot.label.clone(),
                need: self.graph.graph[need].label.clone(),
            })
        })
    }

    /// The stamp dependents see, plus artifact metadata for file nodes.
    async fn stamp(
        &self,
        slot: &Slot<G>,
        signature: Hash32,
        output: &Dynamic,
    ) -> Result<(Hash32, Option<FileMeta>), Arc<TaskError>> {
        let contract = |msg: String| Arc::new(TaskError::Contract(slot.label.clone(), msg));

        match slot.kind() {
            TaskKind::File => {
                let declared = slot
                    .target
                    .as_ref()
                    .ok_or_else(|| contract("no declared target".into()))?;

                let target = output
                    .downcast_ref::<Target>()
                    .ok_or_else(|| contract("file recipe did not return a Target".into()))?;

                if target.path != *declared {
                    return Err(contract(format!(
                        "produced {} instead of the declared {}",
                        target.path, declared
                    )));
                }

                if !declared.is_file() {
                    return Err(contract(format!("{declared} does not exist after the recipe ran")));
                }

                let meta = FileMeta::read(declared)
                    .map_err(|e| contract(format!("couldn't stat {declared}: {e}")))?;
                let hash = hash_file(declared.clone())
                    .await
                    .map_err(|e| contract(format!("couldn't hash {declared}: {e}")))?;

                Ok((hash, Some(meta)))
            }
            TaskKind::Phony => Ok((
                Blake3Hasher::new()
                    .digest(self.run_id)
                    .chunk(slot.key.canonical())
                    .finish32(),
                None,
            )),
            TaskKind::Task => {
                let bytes = self.encode(slot, output)?;
                Ok((
                    Blake3Hasher::new().digest(signature).chunk(bytes).finish32(),
                    None,
                ))
            }
            TaskKind::Oracle | TaskKind::Computed => {
                Ok((Hash32::hash(self.encode(slot, output)?), None))
            }
        }
    }

    fn encode(&self, slot: &Slot<G>, output: &Dynamic) -> Result<Vec<u8>, Arc<TaskError>> {
        slot.task
            .as_ref()
            .ok_or_else(|| Arc::new(TaskError::Contract(slot.label.clone(), "undeclared".into())))?
            .encode(output)
            .map_err(|e| Arc::new(TaskError::Recipe(slot.label.clone(), e)))
    }

    /// Looks for a journaled result recorded under `signature`.
    async fn reuse(&self, slot: &Slot<G>, signature: Hash32) -> Option<Done> {
        let entry = self.lock_journal().get(slot.key.canonical()).cloned()?;

        if entry.signature != signature {
            tracing::debug!("{} changed inputs", slot.label);
            return None;
        }

        if slot.kind() == TaskKind::File {
            let path = slot.target.clone()?;
            let meta = FileMeta::read(&path).ok()?;

            // Same size and mtime as recorded is taken as unchanged, anything
            // else has to hash back to the recorded stamp.
            if entry.file != Some(meta) {
                let hash = hash_file(path.clone()).await.ok()?;
                if hash != entry.stamp {
                    tracing::debug!("{} was modified on disk", path);
                    return None;
                }
            }
        }

        let task = slot.task.as_ref()?;
        let output = task.decode(&entry.output).ok()?;

        let produced = task.produces(self.graph.env(), &output);
        if let Some(missing) = produced.iter().find(|path| !path.is_file()) {
            tracing::debug!("{} lost {missing}", slot.label);
            return None;
        }

        Some(Done {
            output,
            stamp: entry.stamp,
        })
    }

    fn lock_journal(&self) -> MutexGuard<'_, Journal> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_report(&self) -> MutexGuard<'_, Diagnostics> {
        self.report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn hash_file(path: camino::Utf8PathBuf) -> std::io::Result<Hash32> {
    tokio::task::spawn_blocking(move || Hash32::hash_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn task_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

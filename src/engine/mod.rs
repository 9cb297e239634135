//! Build orchestration.
//!
//! [`Engine`] ties the pieces together. `build` assembles the graph,
//! fingerprints it, runs the scheduler, and records the run in the build
//! log. The remaining operations query what earlier builds left behind:
//! artifacts by name and build, the log history, and garbage collection.
//!
//! ```
//! use std::sync::Arc;
//! use polyflow::derivation::{Derivation, Pipeline};
//! use polyflow::engine::{BuildOptions, Engine};
//! use polyflow::language::Language;
//! use polyflow::runtime::{JinjaRuntime, RuntimeRegistry};
//!
//! let mut runtimes = RuntimeRegistry::empty();
//! runtimes.register(Arc::new(JinjaRuntime::new()));
//! let engine = Engine::in_memory(runtimes);
//! let pipeline = Pipeline::new(".")
//!     .with(Derivation::expr("a", Language::Jinja, "[1, 2, 3]"))
//!     .with(Derivation::expr("b", Language::Jinja, "a | sum"));
//! let report = engine.build(&pipeline, &BuildOptions::default()).expect("build");
//! assert!(report.is_complete());
//! ```

mod cancel;
mod scheduler;

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::artifact::{Artifact, ArtifactRef, Fingerprint, Format};
use crate::build_log::{
    BuildLog, BuildRecord, Clock, FsBuildLog, LogEntry, LogError, LogHistory, MemoryBuildLog,
    NodeRecord, NodeStatus, Outcome, SystemClock,
};
use crate::codec::CodecRegistry;
use crate::convert::{ConversionError, ConverterRegistry};
use crate::derivation::Pipeline;
use crate::executor::Executor;
use crate::fingerprint::{FingerprintEngine, FingerprintError, Fingerprints};
use crate::graph::{Dag, GraphError};
use crate::language::Language;
use crate::runtime::{Interpreters, RuntimeError, RuntimeRegistry};
use crate::status::{SilentReporter, StatusReporter};
use crate::store::{FsStore, MemoryStore, Store, StoreError};

pub use cancel::CancellationToken;

use scheduler::{Scheduler, Settled};

/// Upper bound on worker threads.
pub const MAX_JOBS: usize = 64;

/// Errors that abort an engine operation as a whole.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// The pipeline does not form a valid graph.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    /// A fingerprint could not be computed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// The artifact store failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// The build log failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Log(#[from] LogError),

    /// An artifact could not be converted for the caller.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Conversion(#[from] ConversionError),

    /// A runtime could not be prepared.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),

    /// Writing engine state or exports failed.
    #[error("failed to write '{path}'")]
    #[diagnostic(code(polyflow::engine::io))]
    Io {
        /// Path being written.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// Engine state could not be encoded.
    #[error("failed to encode {what}")]
    #[diagnostic(code(polyflow::engine::encode))]
    Encode {
        /// What was being encoded.
        what: &'static str,
        /// Encoder failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Options for [`Engine::build`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Execute nodes. When false only the plan is computed.
    pub build: bool,
    /// Worker threads, between 1 and [`MAX_JOBS`].
    pub jobs: usize,
    /// Stops dispatch when cancelled.
    pub cancel: CancellationToken,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            build: true,
            jobs: default_jobs(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Available parallelism, capped at [`MAX_JOBS`].
#[must_use]
pub fn default_jobs() -> usize {
    thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(MAX_JOBS)
}

/// Per-node line of a [`BuildReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    /// Derivation name.
    pub name: String,
    /// Derivation language.
    pub language: Language,
    /// Fingerprint for this run.
    pub fingerprint: Fingerprint,
    /// Final (or planned) status.
    pub status: NodeStatus,
    /// Names of the direct upstream derivations.
    pub upstream: Vec<String>,
    /// Stored artifact, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// Failure message for failed nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of [`Engine::build`]. Lists every node in build order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Run outcome; absent for plan-only runs.
    pub outcome: Option<Outcome>,
    /// Identifier of the log entry, absent for plan-only runs.
    pub log_id: Option<String>,
    /// Every node, in build order.
    pub nodes: Vec<NodeReport>,
}

impl BuildReport {
    /// The line for `name`.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Status of `name`.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.node(name).map(|node| node.status)
    }

    /// Number of nodes with `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|node| node.status == status).count()
    }

    /// Whether the run executed and every node was rebuilt or reused.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome == Some(Outcome::Complete)
    }
}

/// Cache state of one node, from [`Engine::inspect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inspection {
    /// Derivation name.
    pub name: String,
    /// Derivation language.
    pub language: Language,
    /// Current fingerprint.
    pub fingerprint: Fingerprint,
    /// Stored artifact for the fingerprint, if any.
    pub artifact: Option<ArtifactRef>,
}

impl Inspection {
    /// Whether the next build would reuse this node.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        self.artifact.is_some()
    }
}

/// An artifact retrieved from a logged build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    /// Log entry the artifact was taken from.
    pub build_id: String,
    /// The node's record in that entry.
    pub record: NodeRecord,
    /// The artifact, possibly converted.
    pub artifact: Artifact,
}

/// Options for [`Engine::gc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOptions {
    /// Drop log entries recorded before this instant first.
    pub keep_since: Option<OffsetDateTime>,
    /// Report what would be removed without removing it.
    pub dry_run: bool,
}

/// What [`Engine::gc`] removed (or would remove).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Log entries dropped by `keep_since`.
    pub removed_entries: Vec<String>,
    /// Store entries no retained log entry references.
    pub removed_artifacts: Vec<Fingerprint>,
    /// Store entries kept.
    pub retained_artifacts: usize,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

/// Files written by [`Engine::export`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Exported log entry.
    pub build_id: String,
    /// Files written, artifacts first and the entry summary last.
    pub files: Vec<Utf8PathBuf>,
}

/// The build engine.
pub struct Engine {
    runtimes: RuntimeRegistry,
    converters: ConverterRegistry,
    codecs: CodecRegistry,
    store: Arc<dyn Store>,
    log: Arc<dyn BuildLog>,
    reporter: Box<dyn StatusReporter>,
    state_dir: Option<Utf8PathBuf>,
}

impl Engine {
    /// Engine over an explicit store and log, with default converters and
    /// hooks and no progress output.
    #[must_use]
    pub fn new(runtimes: RuntimeRegistry, store: Arc<dyn Store>, log: Arc<dyn BuildLog>) -> Self {
        Self {
            runtimes,
            converters: ConverterRegistry::with_defaults(),
            codecs: CodecRegistry::with_defaults(),
            store,
            log,
            reporter: Box::new(SilentReporter),
            state_dir: None,
        }
    }

    /// Engine keeping everything in memory.
    #[must_use]
    pub fn in_memory(runtimes: RuntimeRegistry) -> Self {
        Self::new(
            runtimes,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBuildLog::default()),
        )
    }

    /// Durable engine rooted at `state_dir`: the store lives in `store/` and
    /// the log in `logs/`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the directories cannot be created or a
    /// runtime cannot be prepared.
    pub fn open(
        state_dir: impl Into<Utf8PathBuf>,
        interpreters: &Interpreters,
    ) -> Result<Self, EngineError> {
        Self::open_with_clock(state_dir, interpreters, Arc::new(SystemClock))
    }

    /// [`Engine::open`] with an explicit clock for log timestamps.
    ///
    /// # Errors
    ///
    /// See [`Engine::open`].
    pub fn open_with_clock(
        state_dir: impl Into<Utf8PathBuf>,
        interpreters: &Interpreters,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let state_dir = state_dir.into();
        let store = FsStore::open(state_dir.join("store"))?;
        let log = FsBuildLog::open(state_dir.join("logs"), clock)?;
        let runtimes = RuntimeRegistry::with_defaults(interpreters)?;
        tracing::debug!(state_dir = %state_dir, "opened engine state");
        Ok(Self::new(runtimes, Arc::new(store), Arc::new(log)).with_state_dir(state_dir))
    }

    /// Replace the converter registry.
    #[must_use]
    pub fn with_converters(mut self, converters: ConverterRegistry) -> Self {
        self.converters = converters;
        self
    }

    /// Replace the serialization hooks.
    #[must_use]
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Report progress through `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Box<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Directory receiving `plan.json`.
    #[must_use]
    pub fn with_state_dir(mut self, state_dir: impl Into<Utf8PathBuf>) -> Self {
        self.state_dir = Some(state_dir.into());
        self
    }

    /// The artifact store.
    #[must_use]
    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    /// The build log.
    #[must_use]
    pub fn log(&self) -> &dyn BuildLog {
        &*self.log
    }

    fn executor(&self) -> Executor<'_> {
        Executor::new(&self.runtimes, &self.converters, &self.codecs)
    }

    fn prepare(pipeline: &Pipeline) -> Result<(Dag, Fingerprints), EngineError> {
        let dag = Dag::from_pipeline(pipeline)?;
        let fingerprints = FingerprintEngine::new(&dag).compute()?;
        Ok((dag, fingerprints))
    }

    /// Build `pipeline`, or only plan it when `options.build` is false.
    ///
    /// Executed runs are always recorded in the build log, including failed
    /// and interrupted ones. Node failures do not make this return an error;
    /// they show up in the report.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the graph or fingerprints cannot be
    /// computed, or the run cannot be recorded.
    pub fn build(
        &self,
        pipeline: &Pipeline,
        options: &BuildOptions,
    ) -> Result<BuildReport, EngineError> {
        let (dag, fingerprints) = Self::prepare(pipeline)?;
        if !options.build {
            return self.plan(&dag, &fingerprints);
        }

        let names: Vec<&str> = dag.build_order().map(|node| node.name()).collect();
        self.reporter.build_started(&names);
        let settled = Scheduler {
            dag: &dag,
            fingerprints: &fingerprints,
            store: &*self.store,
            executor: self.executor(),
            reporter: &*self.reporter,
            cancel: &options.cancel,
            jobs: options.jobs.clamp(1, MAX_JOBS),
        }
        .run();

        let nodes = report_nodes(&dag, &fingerprints, settled);
        let outcome = outcome_of(&nodes);
        let records = nodes
            .iter()
            .map(|node| NodeRecord {
                name: node.name.clone(),
                language: node.language,
                fingerprint: node.fingerprint.clone(),
                status: node.status,
                artifact: node.artifact.clone(),
                error: node.error.clone(),
            })
            .collect();
        let entry = self.log.record(BuildRecord {
            outcome,
            nodes: records,
        })?;
        self.reporter.build_finished(outcome);
        tracing::info!(build = %entry.id, %outcome, "build recorded");
        Ok(BuildReport {
            outcome: Some(outcome),
            log_id: Some(entry.id),
            nodes,
        })
    }

    fn plan(&self, dag: &Dag, fingerprints: &Fingerprints) -> Result<BuildReport, EngineError> {
        let settled = dag
            .nodes()
            .iter()
            .map(|node| -> Result<Settled, StoreError> {
                let cached = match fingerprints.get(node.id()) {
                    Some(fingerprint) => self.store.locate(fingerprint)?,
                    None => None,
                };
                Ok(match cached {
                    Some(reference) => Settled {
                        status: NodeStatus::Reused,
                        artifact: Some(reference),
                        error: None,
                    },
                    None => Settled {
                        status: NodeStatus::Pending,
                        artifact: None,
                        error: None,
                    },
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let report = BuildReport {
            outcome: None,
            log_id: None,
            nodes: report_nodes(dag, fingerprints, settled),
        };
        if let Some(state_dir) = &self.state_dir {
            let json = serde_json::to_vec_pretty(&report).map_err(|source| EngineError::Encode {
                what: "build plan",
                source,
            })?;
            write_file(&state_dir.join("plan.json"), &json)?;
        }
        Ok(report)
    }

    /// Fingerprint `pipeline` and report which nodes are already stored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the graph, fingerprints, or store lookups
    /// fail.
    pub fn inspect(&self, pipeline: &Pipeline) -> Result<Vec<Inspection>, EngineError> {
        let (dag, fingerprints) = Self::prepare(pipeline)?;
        dag.build_order()
            .filter_map(|node| Some((node, fingerprints.get(node.id())?)))
            .map(|(node, fingerprint)| -> Result<Inspection, EngineError> {
                Ok(Inspection {
                    name: node.name().to_owned(),
                    language: node.derivation().language(),
                    fingerprint: fingerprint.clone(),
                    artifact: self.store.locate(fingerprint)?,
                })
            })
            .collect()
    }

    /// Artifact of `name` from a logged build, exactly as stored.
    ///
    /// Without a selector the most recent build that produced `name` is used.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Log`] when no build matches and
    /// [`EngineError::Store`] when the artifact was collected.
    pub fn read(&self, name: &str, selector: Option<&str>) -> Result<Retrieved, EngineError> {
        let (entry, record) = self.log.find(name, selector)?;
        let artifact = self.store.get(&record.fingerprint)?;
        Ok(Retrieved {
            build_id: entry.id,
            record,
            artifact,
        })
    }

    /// Most recent artifact of `name`, converted into `language`.
    ///
    /// Without a language the artifact is returned in the producing
    /// derivation's native format; interchange artifacts are decoded by the
    /// hook that wrote them.
    ///
    /// # Errors
    ///
    /// As [`Engine::read`], plus [`EngineError::Conversion`] when no
    /// conversion applies.
    pub fn load(&self, name: &str, language: Option<Language>) -> Result<Retrieved, EngineError> {
        let mut retrieved = self.read(name, None)?;
        let target = language.unwrap_or(retrieved.record.language);
        retrieved.artifact = match retrieved.artifact.format() {
            Format::Interchange(hook) if self.codecs.get(hook).is_ok() => {
                self.codecs.decode(hook, &retrieved.artifact, target)?
            }
            _ => self.converters.convert(&retrieved.artifact, target)?,
        };
        Ok(retrieved)
    }

    /// Recorded builds, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Log`] when the log cannot be read.
    pub fn history(&self) -> Result<LogHistory<'_>, EngineError> {
        Ok(self.log.list()?)
    }

    /// Remove store entries no retained log entry references.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the log or store cannot be read or
    /// modified.
    pub fn gc(&self, options: GcOptions) -> Result<GcReport, EngineError> {
        let summaries = self.log.summaries()?;
        let (expired, retained): (Vec<_>, Vec<_>) = summaries
            .into_iter()
            .partition(|summary| options.keep_since.is_some_and(|since| summary.timestamp < since));

        let mut live = BTreeSet::new();
        for summary in &retained {
            let entry = self.log.get(&summary.id)?;
            live.extend(
                entry
                    .nodes
                    .into_iter()
                    .filter_map(|node| node.artifact.map(|artifact| artifact.fingerprint)),
            );
        }
        let (garbage, kept): (Vec<_>, Vec<_>) = self
            .store
            .fingerprints()?
            .into_iter()
            .partition(|fingerprint| !live.contains(fingerprint));

        let report = GcReport {
            removed_entries: expired.into_iter().map(|summary| summary.id).collect(),
            removed_artifacts: garbage,
            retained_artifacts: kept.len(),
            dry_run: options.dry_run,
        };
        if !options.dry_run {
            for id in &report.removed_entries {
                self.log.remove(id)?;
            }
            for fingerprint in &report.removed_artifacts {
                self.store.remove(fingerprint)?;
            }
        }
        tracing::info!(
            entries = report.removed_entries.len(),
            artifacts = report.removed_artifacts.len(),
            dry_run = options.dry_run,
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Copy every artifact of a logged build into `dir`.
    ///
    /// Without a selector the most recent build is exported. Each artifact is
    /// written as `<name>.<ext>` and the log entry as `build.json`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the build cannot be selected, an artifact
    /// is missing, or a file cannot be written.
    pub fn export(
        &self,
        dir: &Utf8Path,
        selector: Option<&str>,
    ) -> Result<ExportReport, EngineError> {
        let entry = self.select_entry(selector)?;
        fs::create_dir_all(dir).map_err(|source| EngineError::Io {
            path: dir.to_owned(),
            source,
        })?;
        let mut files = Vec::new();
        for node in &entry.nodes {
            let Some(reference) = &node.artifact else {
                continue;
            };
            let artifact = self.store.get(&reference.fingerprint)?;
            let path = dir.join(format!("{}.{}", node.name, extension(artifact.format())));
            write_file(&path, artifact.bytes())?;
            files.push(path);
        }
        let json = serde_json::to_vec_pretty(&entry).map_err(|source| EngineError::Encode {
            what: "build log entry",
            source,
        })?;
        let summary = dir.join("build.json");
        write_file(&summary, &json)?;
        files.push(summary);
        Ok(ExportReport {
            build_id: entry.id,
            files,
        })
    }

    fn select_entry(&self, selector: Option<&str>) -> Result<LogEntry, EngineError> {
        if let Some(selector) = selector {
            return Ok(self.log.select(selector)?);
        }
        let latest = self
            .log
            .summaries()?
            .pop()
            .ok_or_else(|| LogError::NotFound("the build log is empty".to_owned()))?;
        Ok(self.log.get(&latest.id)?)
    }
}

fn report_nodes(dag: &Dag, fingerprints: &Fingerprints, settled: Vec<Settled>) -> Vec<NodeReport> {
    let mut settled: Vec<Option<Settled>> = settled.into_iter().map(Some).collect();
    dag.build_order()
        .filter_map(|node| {
            let fingerprint = fingerprints.get(node.id())?.clone();
            let state = settled.get_mut(node.id())?.take()?;
            Some(NodeReport {
                name: node.name().to_owned(),
                language: node.derivation().language(),
                fingerprint,
                status: state.status,
                upstream: node
                    .upstream()
                    .iter()
                    .filter_map(|&up| dag.node(up))
                    .map(|up| up.name().to_owned())
                    .collect(),
                artifact: state.artifact,
                error: state.error,
            })
        })
        .collect()
}

fn outcome_of(nodes: &[NodeReport]) -> Outcome {
    if nodes.iter().any(|node| node.status == NodeStatus::Cancelled) {
        Outcome::Interrupted
    } else if nodes.iter().all(|node| node.status.is_built()) {
        Outcome::Complete
    } else {
        Outcome::Failed
    }
}

fn extension(format: &Format) -> &str {
    match format {
        Format::Native(Language::Shell) => "txt",
        Format::Native(_) => "json",
        Format::Interchange(name) => match name.as_str() {
            "text" | "lines" => "txt",
            other => other,
        },
    }
}

fn write_file(path: &Utf8Path, bytes: &[u8]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| EngineError::Io {
            path: parent.to_owned(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| EngineError::Io {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::Derivation;
    use crate::runtime::JinjaRuntime;
    use rstest::{fixture, rstest};
    use serde_json::json;
    use tempfile::TempDir;

    #[fixture]
    fn engine() -> Engine {
        let mut runtimes = RuntimeRegistry::empty();
        runtimes.register(Arc::new(JinjaRuntime::new()));
        Engine::in_memory(runtimes)
    }

    fn pipeline(values: &str) -> Pipeline {
        Pipeline::new(".")
            .with(Derivation::expr("a", Language::Jinja, values))
            .with(Derivation::expr("b", Language::Jinja, "a | map('mul', 2) | list"))
            .with(Derivation::expr("c", Language::Jinja, "b | sum"))
    }

    fn statuses(report: &BuildReport) -> Vec<NodeStatus> {
        report.nodes.iter().map(|node| node.status).collect()
    }

    #[rstest]
    fn rebuilds_then_reuses(engine: Engine) {
        let options = BuildOptions::default();
        let first = engine.build(&pipeline("[1, 2, 3]"), &options).expect("first");
        assert_eq!(statuses(&first), [NodeStatus::Rebuilt; 3]);
        let second = engine.build(&pipeline("[1, 2, 3]"), &options).expect("second");
        assert_eq!(statuses(&second), [NodeStatus::Reused; 3]);
        let c = engine.load("c", None).expect("load");
        assert_eq!(c.artifact.to_json().expect("json"), json!(12));
    }

    #[rstest]
    fn failures_block_downstream_and_are_logged(engine: Engine) {
        let broken = Pipeline::new(".")
            .with(Derivation::expr("a", Language::Jinja, "missing + 1"))
            .with(Derivation::expr("b", Language::Jinja, "a + 1"))
            .with(Derivation::expr("c", Language::Jinja, "'fine'"));
        let report = engine.build(&broken, &BuildOptions::default()).expect("build");
        assert_eq!(report.outcome, Some(Outcome::Failed));
        assert_eq!(report.status("a"), Some(NodeStatus::Failed));
        assert_eq!(report.status("b"), Some(NodeStatus::Blocked));
        assert_eq!(report.status("c"), Some(NodeStatus::Rebuilt));
        assert!(report.node("a").and_then(|n| n.error.as_deref()).is_some());
        let history = engine.history().expect("history");
        assert_eq!(history.len(), 1);
    }

    #[rstest]
    fn cancelled_runs_are_interrupted(engine: Engine) {
        let options = BuildOptions::default();
        options.cancel.cancel();
        let report = engine.build(&pipeline("[1]"), &options).expect("build");
        assert_eq!(report.outcome, Some(Outcome::Interrupted));
        assert_eq!(report.count(NodeStatus::Cancelled), 3);
    }

    #[rstest]
    fn plan_only_executes_nothing() {
        let state = TempDir::new().expect("temp dir");
        let state_dir = Utf8PathBuf::try_from(state.path().to_path_buf()).expect("utf8");
        let engine = engine().with_state_dir(&state_dir);
        let options = BuildOptions {
            build: false,
            ..BuildOptions::default()
        };
        let plan = engine.build(&pipeline("[1]"), &options).expect("plan");
        assert_eq!(plan.outcome, None);
        assert_eq!(statuses(&plan), [NodeStatus::Pending; 3]);
        assert!(engine.history().expect("history").is_empty());
        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(state_dir.join("plan.json")).expect("plan file"))
                .expect("json");
        assert_eq!(written["nodes"][2]["upstream"], json!(["b"]));
    }

    #[rstest]
    fn inspect_reports_stale_nodes(engine: Engine) {
        engine
            .build(&pipeline("[1]"), &BuildOptions::default())
            .expect("build");
        let states = engine.inspect(&pipeline("[2]")).expect("inspect");
        assert!(states.iter().all(|state| !state.is_cached()));
        let states = engine.inspect(&pipeline("[1]")).expect("inspect");
        assert!(states.iter().all(Inspection::is_cached));
    }

    #[rstest]
    fn load_converts_between_languages(engine: Engine) {
        engine
            .build(&pipeline("[1, 2]"), &BuildOptions::default())
            .expect("build");
        let b = engine.load("b", Some(Language::Shell)).expect("load");
        assert_eq!(b.artifact.format(), &Format::Native(Language::Shell));
        assert_eq!(b.artifact.bytes(), b"[2,4]");
    }

    struct Ticking(std::sync::Mutex<OffsetDateTime>);

    impl Clock for Ticking {
        fn now(&self) -> OffsetDateTime {
            let mut now = self.0.lock().expect("clock");
            *now += time::Duration::minutes(1);
            *now
        }
    }

    #[test]
    fn gc_keeps_artifacts_of_retained_builds() {
        let mut runtimes = RuntimeRegistry::empty();
        runtimes.register(Arc::new(JinjaRuntime::new()));
        let clock = Ticking(std::sync::Mutex::new(time::macros::datetime!(2025-01-01 0:00 UTC)));
        let engine = Engine::new(
            runtimes,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBuildLog::new(Arc::new(clock))),
        );
        let options = BuildOptions::default();
        engine.build(&pipeline("[1]"), &options).expect("old");
        engine.build(&pipeline("[1, 2]"), &options).expect("new");
        let dry = engine
            .gc(GcOptions {
                keep_since: None,
                dry_run: true,
            })
            .expect("gc");
        assert!(dry.removed_artifacts.is_empty());
        assert_eq!(dry.retained_artifacts, 6);

        let newest = engine.log.summaries().expect("summaries");
        let since = newest.last().expect("entry").timestamp;
        let report = engine
            .gc(GcOptions {
                keep_since: Some(since),
                dry_run: false,
            })
            .expect("gc");
        assert_eq!(report.removed_entries.len(), 1);
        assert_eq!(report.removed_artifacts.len(), 3);
        assert_eq!(engine.store.fingerprints().expect("list").len(), 3);
    }

    #[rstest]
    fn export_writes_artifacts_and_entry(engine: Engine) {
        engine
            .build(&pipeline("[1, 2, 3]"), &BuildOptions::default())
            .expect("build");
        let out = TempDir::new().expect("temp dir");
        let dir = Utf8PathBuf::try_from(out.path().join("export")).expect("utf8");
        let report = engine.export(&dir, None).expect("export");
        assert_eq!(report.files.len(), 4);
        assert_eq!(fs::read_to_string(dir.join("c.json")).expect("c"), "12");
        assert!(dir.join("build.json").exists());
    }
}

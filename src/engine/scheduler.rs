//! Parallel, dependency-ordered execution of a fingerprinted graph.
//!
//! The dispatch thread owns all bookkeeping. It hands ready nodes to a fixed
//! pool of workers over a channel and settles each node as results come
//! back. A node is ready once every upstream is rebuilt or reused; a failure
//! blocks every transitive descendant. Nodes whose fingerprint is already
//! stored settle as reused without reaching a worker.
//!
//! Workers serialise on a per-fingerprint lock, so two nodes with identical
//! definitions execute once: the second finds the first one's artifact, or
//! the record of its failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use crate::artifact::{Artifact, ArtifactRef, Fingerprint};
use crate::build_log::NodeStatus;
use crate::executor::Executor;
use crate::fingerprint::Fingerprints;
use crate::graph::{Dag, Node, NodeId};
use crate::status::StatusReporter;
use crate::store::Store;

use super::CancellationToken;

/// Final state of one node after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Settled {
    pub status: NodeStatus,
    pub artifact: Option<ArtifactRef>,
    pub error: Option<String>,
}

impl Settled {
    const fn done(status: NodeStatus, artifact: ArtifactRef) -> Self {
        Self {
            status,
            artifact: Some(artifact),
            error: None,
        }
    }

    const fn bare(status: NodeStatus) -> Self {
        Self {
            status,
            artifact: None,
            error: None,
        }
    }

    const fn failed(message: String) -> Self {
        Self {
            status: NodeStatus::Failed,
            artifact: None,
            error: Some(message),
        }
    }
}

/// Borrowed inputs of one scheduled run.
pub(super) struct Scheduler<'a> {
    pub dag: &'a Dag,
    pub fingerprints: &'a Fingerprints,
    pub store: &'a dyn Store,
    pub executor: Executor<'a>,
    pub reporter: &'a dyn StatusReporter,
    pub cancel: &'a CancellationToken,
    pub jobs: usize,
}

impl Scheduler<'_> {
    /// Run every node and return their final states indexed by node id.
    pub(super) fn run(&self) -> Vec<Settled> {
        let mut progress = Progress::new(self.dag);
        let locks = FingerprintLocks::default();
        let worker = Worker {
            dag: self.dag,
            fingerprints: self.fingerprints,
            store: self.store,
            executor: self.executor,
            locks: &locks,
        };
        let threads = self.jobs.clamp(1, self.dag.len().max(1));

        let (job_tx, job_rx) = mpsc::channel::<NodeId>();
        let (done_tx, done_rx) = mpsc::channel::<(NodeId, Settled)>();
        let job_rx = Mutex::new(job_rx);
        thread::scope(|scope| {
            for _ in 0..threads {
                let done_tx = done_tx.clone();
                let job_rx = &job_rx;
                scope.spawn(move || {
                    loop {
                        let next = job_rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                        let Ok(id) = next else { break };
                        if done_tx.send((id, worker.build(id))).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            let mut in_flight = 0usize;
            loop {
                while !self.cancel.is_cancelled() {
                    let Some(id) = progress.next_ready() else {
                        break;
                    };
                    if self.dispatch(id, &job_tx, &mut progress) {
                        in_flight += 1;
                    }
                }
                if in_flight == 0 {
                    break;
                }
                match done_rx.recv() {
                    Ok((id, settled)) => {
                        in_flight -= 1;
                        self.settle(&mut progress, id, settled);
                    }
                    Err(_) => break,
                }
            }
            drop(job_tx);
        });

        if self.cancel.is_cancelled() {
            tracing::info!("build cancelled; undispatched derivations were skipped");
        }
        progress.finish()
    }

    /// Settle `id` from the store or queue it; returns whether it was queued.
    fn dispatch(&self, id: NodeId, jobs: &mpsc::Sender<NodeId>, progress: &mut Progress) -> bool {
        let Some((node, fingerprint)) = self.lookup(id) else {
            self.settle(progress, id, Settled::failed(format!("unknown node {id}")));
            return false;
        };
        match self.store.locate(fingerprint) {
            Ok(Some(reference)) => {
                tracing::info!(derivation = node.name(), "reusing stored artifact");
                self.settle(progress, id, Settled::done(NodeStatus::Reused, reference));
                false
            }
            Ok(None) => {
                self.reporter.node_started(node.name());
                if jobs.send(id).is_ok() {
                    true
                } else {
                    let message = "worker pool stopped".to_owned();
                    self.settle(progress, id, Settled::failed(message));
                    false
                }
            }
            Err(err) => {
                self.settle(progress, id, Settled::failed(describe(&err)));
                false
            }
        }
    }

    fn settle(&self, progress: &mut Progress, id: NodeId, settled: Settled) {
        if let Some(node) = self.dag.node(id) {
            self.reporter.node_finished(node.name(), settled.status);
        }
        for blocked in progress.settle(self.dag, id, settled) {
            if let Some(node) = self.dag.node(blocked) {
                tracing::info!(derivation = node.name(), "blocked by failed upstream");
                self.reporter.node_finished(node.name(), NodeStatus::Blocked);
            }
        }
    }

    fn lookup(&self, id: NodeId) -> Option<(&Node, &Fingerprint)> {
        Some((self.dag.node(id)?, self.fingerprints.get(id)?))
    }
}

/// Readiness bookkeeping owned by the dispatch thread.
#[derive(Debug)]
struct Progress {
    settled: Vec<Option<Settled>>,
    waiting: Vec<usize>,
    ready: VecDeque<NodeId>,
}

impl Progress {
    fn new(dag: &Dag) -> Self {
        let waiting: Vec<usize> = dag.nodes().iter().map(|n| n.upstream().len()).collect();
        let ready = dag
            .order()
            .iter()
            .copied()
            .filter(|&id| waiting.get(id) == Some(&0))
            .collect();
        Self {
            settled: vec![None; dag.len()],
            waiting,
            ready,
        }
    }

    fn next_ready(&mut self) -> Option<NodeId> {
        self.ready.pop_front()
    }

    /// Record `id` and return the descendants that became blocked.
    fn settle(&mut self, dag: &Dag, id: NodeId, settled: Settled) -> Vec<NodeId> {
        let built = settled.status.is_built();
        if let Some(slot) = self.settled.get_mut(id) {
            *slot = Some(settled);
        }
        let Some(node) = dag.node(id) else {
            return Vec::new();
        };
        if built {
            for &down in node.downstream() {
                let Some(count) = self.waiting.get_mut(down) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                let unsettled = matches!(self.settled.get(down), Some(None));
                if *count == 0 && unsettled {
                    self.ready.push_back(down);
                }
            }
            return Vec::new();
        }
        let mut blocked = Vec::new();
        for down in dag.descendants(id) {
            if let Some(slot) = self.settled.get_mut(down)
                && slot.is_none()
            {
                *slot = Some(Settled::bare(NodeStatus::Blocked));
                blocked.push(down);
            }
        }
        blocked
    }

    /// Final states; anything never settled was cancelled.
    fn finish(self) -> Vec<Settled> {
        self.settled
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Settled::bare(NodeStatus::Cancelled)))
            .collect()
    }
}

/// Per-fingerprint build locks plus the fingerprints that failed this run.
#[derive(Debug, Default)]
struct FingerprintLocks {
    locks: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    failed: Mutex<HashSet<Fingerprint>>,
}

impl FingerprintLocks {
    fn lock_for(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(fingerprint.clone()).or_default())
    }

    fn has_failed(&self, fingerprint: &Fingerprint) -> bool {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    fn mark_failed(&self, fingerprint: &Fingerprint) {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.clone());
    }
}

#[derive(Clone, Copy)]
struct Worker<'a> {
    dag: &'a Dag,
    fingerprints: &'a Fingerprints,
    store: &'a dyn Store,
    executor: Executor<'a>,
    locks: &'a FingerprintLocks,
}

impl Worker<'_> {
    fn build(&self, id: NodeId) -> Settled {
        let (Some(node), Some(fingerprint)) = (self.dag.node(id), self.fingerprints.get(id)) else {
            return Settled::failed(format!("unknown node {id}"));
        };
        let lock = self.locks.lock_for(fingerprint);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.locks.has_failed(fingerprint) {
            return Settled::failed(format!(
                "an identical derivation ({}) already failed in this run",
                fingerprint.short()
            ));
        }
        match self.store.locate(fingerprint) {
            Ok(Some(reference)) => {
                tracing::info!(
                    derivation = node.name(),
                    "built concurrently by an identical derivation"
                );
                return Settled::done(NodeStatus::Reused, reference);
            }
            Ok(None) => {}
            Err(err) => return Settled::failed(describe(&err)),
        }

        tracing::info!(
            derivation = node.name(),
            language = %node.derivation().language(),
            "building"
        );
        match self.execute(node, fingerprint) {
            Ok(reference) => {
                tracing::info!(
                    derivation = node.name(),
                    fingerprint = fingerprint.short(),
                    "rebuilt"
                );
                Settled::done(NodeStatus::Rebuilt, reference)
            }
            Err(message) => {
                self.locks.mark_failed(fingerprint);
                tracing::info!(derivation = node.name(), error = %message, "failed");
                Settled::failed(message)
            }
        }
    }

    fn execute(&self, node: &Node, fingerprint: &Fingerprint) -> Result<ArtifactRef, String> {
        let upstream = node
            .upstream()
            .iter()
            .map(|&up| self.upstream_artifact(up))
            .collect::<Result<Vec<_>, String>>()?;
        let artifact = self
            .executor
            .execute(node.derivation(), self.dag.root(), &upstream)
            .map_err(|err| describe(&err))?;
        self.store
            .put(fingerprint, &artifact)
            .map_err(|err| describe(&err))
    }

    fn upstream_artifact(&self, id: NodeId) -> Result<(String, Artifact), String> {
        let (Some(node), Some(fingerprint)) = (self.dag.node(id), self.fingerprints.get(id)) else {
            return Err(format!("unknown upstream node {id}"));
        };
        let artifact = self.store.get(fingerprint).map_err(|err| describe(&err))?;
        Ok((node.name().to_owned(), artifact))
    }
}

/// Render an error and its source chain on one line.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

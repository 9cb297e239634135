//! Build progress reporting for accessible and standard output modes.
//!
//! The scheduler drives a [`StatusReporter`] from its dispatch thread: one call
//! when the run starts, one as each node is dispatched, and one as each node
//! settles. Standard mode keeps a persistent `indicatif` line per node;
//! accessible mode prints plain, labelled lines to stderr.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::build_log::{NodeStatus, Outcome};

/// Report build progress to the user.
pub trait StatusReporter {
    /// A run over `nodes` (in build order) is starting.
    fn build_started(&self, nodes: &[&str]);

    /// A node was handed to a worker.
    fn node_started(&self, name: &str);

    /// A node reached its final status.
    fn node_finished(&self, name: &str, status: NodeStatus);

    /// The run ended.
    fn build_finished(&self, outcome: Outcome);
}

/// Accessible reporter: writes static, labelled lines to stderr.
#[derive(Debug, Default)]
pub struct AccessibleReporter {
    progress: Mutex<(usize, usize)>,
}

impl AccessibleReporter {
    /// Create a reporter with no run in progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusReporter for AccessibleReporter {
    fn build_started(&self, nodes: &[&str]) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = (0, nodes.len());
        drop(writeln!(io::stderr(), "Building {} derivations", nodes.len()));
    }

    fn node_started(&self, name: &str) {
        drop(writeln!(io::stderr(), "Running {name}"));
    }

    fn node_finished(&self, name: &str, status: NodeStatus) {
        let (done, total) = {
            let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            progress.0 += 1;
            *progress
        };
        // Status output failures must not abort the build.
        drop(writeln!(io::stderr(), "[{done}/{total}] {name}: {status}"));
    }

    fn build_finished(&self, outcome: Outcome) {
        drop(writeln!(io::stderr(), "Build {outcome}"));
    }
}

/// Silent reporter: emits nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl StatusReporter for SilentReporter {
    fn build_started(&self, _nodes: &[&str]) {}
    fn node_started(&self, _name: &str) {}
    fn node_finished(&self, _name: &str, _status: NodeStatus) {}
    fn build_finished(&self, _outcome: Outcome) {}
}

struct IndicatifState {
    progress: MultiProgress,
    bars: Vec<(String, ProgressBar)>,
    style: ProgressStyle,
    is_hidden: bool,
}

/// Standard reporter backed by `indicatif::MultiProgress`.
pub struct IndicatifReporter {
    state: Mutex<IndicatifState>,
}

impl IndicatifReporter {
    /// Construct a reporter drawing to stderr.
    #[must_use]
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr_with_hz(12))
    }

    /// Construct a reporter drawing to `target`.
    ///
    /// When the target is hidden the bars are still tracked, and each settled
    /// node is also written to stderr as a plain line.
    #[must_use]
    pub fn with_draw_target(target: ProgressDrawTarget) -> Self {
        let progress = MultiProgress::with_draw_target(target);
        progress.set_move_cursor(false);
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        Self {
            state: Mutex::new(IndicatifState {
                is_hidden: progress.is_hidden(),
                progress,
                bars: Vec::new(),
                style,
            }),
        }
    }

    fn update(&self, name: &str, message: String, finish: bool) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_hidden && finish {
            drop(writeln!(io::stderr(), "{message}"));
        }
        if let Some((_, bar)) = state.bars.iter().find(|(node, _)| node == name) {
            if finish {
                bar.finish_with_message(message);
            } else {
                bar.set_message(message);
                bar.tick();
            }
        }
    }
}

impl std::fmt::Debug for IndicatifReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("IndicatifReporter")
            .field("bars", &state.bars.len())
            .field("is_hidden", &state.is_hidden)
            .finish_non_exhaustive()
    }
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter for IndicatifReporter {
    fn build_started(&self, nodes: &[&str]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for bar in state.bars.drain(..) {
            bar.1.finish_and_clear();
        }
        for name in nodes {
            let bar = state.progress.add(ProgressBar::new_spinner());
            bar.set_style(state.style.clone());
            bar.set_message(format!("{name}: waiting"));
            state.bars.push(((*name).to_owned(), bar));
        }
    }

    fn node_started(&self, name: &str) {
        self.update(name, format!("{name}: running"), false);
    }

    fn node_finished(&self, name: &str, status: NodeStatus) {
        self.update(name, format!("{name}: {status}"), true);
    }

    fn build_finished(&self, outcome: Outcome) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, bar) in &state.bars {
            if !bar.is_finished() {
                bar.finish_with_message(format!("{name}: not run"));
            }
        }
        drop(writeln!(io::stderr(), "Build {outcome}"));
    }
}

impl Drop for IndicatifReporter {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, bar) in &state.bars {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn accessible_reporter_counts_settled_nodes() {
        let reporter = AccessibleReporter::new();
        reporter.build_started(&["a", "b"]);
        reporter.node_finished("a", NodeStatus::Reused);
        let progress = *reporter.progress.lock().expect("progress");
        assert_eq!(progress, (1, 2));
    }

    #[rstest]
    #[case::hidden(ProgressDrawTarget::hidden())]
    #[case::stderr(ProgressDrawTarget::stderr())]
    fn indicatif_reporter_tracks_one_line_per_node(#[case] target: ProgressDrawTarget) {
        let reporter = IndicatifReporter::with_draw_target(target);
        reporter.build_started(&["a", "b", "c"]);
        reporter.node_started("b");
        reporter.node_finished("b", NodeStatus::Rebuilt);
        let state = reporter.state.lock().expect("state");
        assert_eq!(state.bars.len(), 3);
        assert!(
            state
                .bars
                .iter()
                .any(|(name, bar)| name == "b" && bar.is_finished())
        );
    }
}

//! A runtime double for engine tests.
//!
//! [`ScriptedRuntime`] claims a language, evaluates bodies as Jinja
//! expressions, and tags the result with its own language. Every call is
//! recorded by derivation name, and named derivations can be made to fail or
//! to wait on a gate.
//!
//! ```rust
//! use polyflow::language::Language;
//! use test_support::ScriptedRuntime;
//!
//! let runtime = ScriptedRuntime::new(Language::Python).failing("b");
//! assert_eq!(runtime.calls("b"), 0);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use polyflow::artifact::{Artifact, Format};
use polyflow::language::Language;
use polyflow::runtime::{EvalRequest, JinjaRuntime, Runtime, RuntimeError};

/// Records, delays, and fails evaluations on request.
pub struct ScriptedRuntime {
    language: Language,
    inner: JinjaRuntime,
    calls: Mutex<HashMap<String, usize>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    gate: Gate,
}

struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl ScriptedRuntime {
    /// A runtime answering for `language`.
    pub fn new(language: Language) -> Self {
        Self {
            language,
            inner: JinjaRuntime::new(),
            calls: Mutex::new(HashMap::new()),
            failing: HashSet::new(),
            delay: None,
            gate: Gate {
                open: Mutex::new(true),
                changed: Condvar::new(),
            },
        }
    }

    /// Fail every evaluation of `name`.
    #[must_use]
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_owned());
        self
    }

    /// Sleep for `delay` before each evaluation.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold evaluations until [`ScriptedRuntime::open`] is called.
    #[must_use]
    pub fn gated(self) -> Self {
        *self.gate.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self
    }

    /// Release held evaluations.
    pub fn open(&self) {
        *self.gate.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.gate.changed.notify_all();
    }

    /// Number of times `name` was evaluated.
    pub fn calls(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Total evaluations across all derivations.
    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    fn wait_for_gate(&self) {
        let mut open = self.gate.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = self
                .gate
                .changed
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Runtime for ScriptedRuntime {
    fn language(&self) -> Language {
        self.language
    }

    fn evaluate(&self, request: &EvalRequest<'_>) -> Result<Artifact, RuntimeError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(request.derivation.to_owned())
            .or_default() += 1;
        self.wait_for_gate();
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.failing.contains(request.derivation) {
            return Err(RuntimeError::Evaluation(format!(
                "scripted failure in '{}'",
                request.derivation
            )));
        }
        let artifact = self.inner.evaluate(request)?;
        Ok(artifact.retagged(Format::Native(self.language)))
    }
}

//! Test utilities for pipeline builds.
//!
//! This crate provides a scripted runtime double that records and fails
//! evaluations on demand, a deterministic clock for build log timestamps, and
//! temporary project directories.

pub mod clock;
pub mod project;
pub mod runtime;

pub use clock::StepClock;
pub use project::TempProject;
pub use runtime::ScriptedRuntime;

use std::sync::Arc;

use polyflow::engine::Engine;
use polyflow::language::Language;
use polyflow::runtime::{JinjaRuntime, RuntimeRegistry};

/// In-memory engine with the real Jinja runtime and a scripted Python one.
///
/// Python bodies are Jinja expressions, so pipelines can cross the language
/// boundary without an interpreter installed.
pub fn scripted_engine() -> (Engine, Arc<ScriptedRuntime>) {
    let python = Arc::new(ScriptedRuntime::new(Language::Python));
    (Engine::in_memory(registry_with(&python)), python)
}

/// Registry holding the Jinja runtime plus `scripted`.
pub fn registry_with(scripted: &Arc<ScriptedRuntime>) -> RuntimeRegistry {
    let mut runtimes = RuntimeRegistry::empty();
    runtimes.register(Arc::new(JinjaRuntime::new()));
    runtimes.register(scripted.clone());
    runtimes
}

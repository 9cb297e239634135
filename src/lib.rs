//! Polyflow core library.
//!
//! Polyflow builds pipelines of *derivations*: named computations written in
//! Jinja expressions, shell, Python, or R. Derivations reference each other by
//! name, and the references form a dependency graph. Each derivation gets a
//! fingerprint covering its body, language, hooks, extra files, and upstream
//! fingerprints. Artifacts are stored by fingerprint, so unchanged work is
//! reused across runs. Every executed build is appended to a build log and can
//! later be listed, read back, exported, or garbage collected.
//!
//! The [`engine::Engine`] is the entry point for library use; the `polyflow`
//! binary wraps it with [`cli`] and [`runner`].

pub mod artifact;
pub mod ast;
pub mod build_log;
pub mod cli;
pub mod codec;
pub mod config;
pub mod convert;
pub mod derivation;
pub mod engine;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod language;
pub mod manifest;
pub mod output_mode;
pub mod runner;
pub mod runtime;
pub mod status;
pub mod store;

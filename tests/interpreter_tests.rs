//! Builds that run the real Python interpreter through the rendered wrapper.
//!
//! Each test is skipped when `python3` is not installed.
#![cfg(unix)]

use std::process::Command;

use polyflow::artifact::Format;
use polyflow::build_log::NodeStatus;
use polyflow::derivation::{Derivation, Pipeline};
use polyflow::engine::{BuildOptions, Engine};
use polyflow::language::Language;
use polyflow::runtime::{Interpreters, RuntimeRegistry};
use rstest::{fixture, rstest};
use serde_json::json;
use test_support::TempProject;

struct Python {
    project: TempProject,
    engine: Engine,
}

impl Python {
    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.project.root())
    }

    fn value(&self, name: &str) -> serde_json::Value {
        self.engine
            .load(name, None)
            .expect("load")
            .artifact
            .to_json()
            .expect("json")
    }
}

/// `None` when `python3` cannot be started.
#[fixture]
fn python() -> Option<Python> {
    let version = Command::new("python3").arg("--version").output();
    if !version.is_ok_and(|out| out.status.success()) {
        eprintln!("skipping test: python3 must be installed for interpreter tests");
        return None;
    }
    let runtimes = RuntimeRegistry::with_defaults(&Interpreters::default()).expect("runtimes");
    Some(Python {
        project: TempProject::new(),
        engine: Engine::in_memory(runtimes),
    })
}

#[rstest]
fn python_values_cross_into_jinja_and_back(python: Option<Python>) {
    let Some(python) = python else { return };
    let pipeline = python
        .pipeline()
        .with(Derivation::expr("a", Language::Jinja, "[1, 2, 3]"))
        .with(Derivation::expr("b", Language::Python, "[x * 2 for x in a]"))
        .with(Derivation::expr("c", Language::Jinja, "b | sum"));

    let report = python
        .engine
        .build(&pipeline, &BuildOptions::default())
        .expect("build");

    assert!(report.is_complete(), "{:?}", report.nodes);
    assert_eq!(python.value("b"), json!([2, 4, 6]));
    assert_eq!(python.value("c"), json!(12));
    let b = python.engine.load("b", None).expect("load b");
    assert_eq!(b.artifact.format(), &Format::Native(Language::Python));
}

#[rstest]
fn import_bodies_read_project_files(python: Option<Python>) {
    let Some(python) = python else { return };
    python
        .project
        .write("data/points.json", r#"{"xs": [1, 2, 3.5]}"#);
    python.project.write("data/notes.txt", "first\nsecond");
    let pipeline = python
        .pipeline()
        .with(Derivation::import(
            "points",
            Language::Python,
            "data/points.json",
            None,
        ))
        .with(Derivation::import(
            "notes",
            Language::Python,
            "data/notes.txt",
            None,
        ))
        .with(Derivation::expr(
            "summary",
            Language::Python,
            r#"{"total": sum(points["xs"]), "lines": notes.splitlines()}"#,
        ));

    let report = python
        .engine
        .build(&pipeline, &BuildOptions::default())
        .expect("build");

    assert!(report.is_complete(), "{:?}", report.nodes);
    assert_eq!(
        python.value("summary"),
        json!({"total": 6.5, "lines": ["first", "second"]})
    );
}

#[rstest]
fn inputs_named_like_wrapper_modules_are_bound(python: Option<Python>) {
    let Some(python) = python else { return };
    let pipeline = python
        .pipeline()
        .with(Derivation::expr("json", Language::Jinja, "[1]"))
        .with(Derivation::expr("sys", Language::Jinja, "2"))
        .with(Derivation::expr("open", Language::Jinja, "3"))
        .with(Derivation::expr(
            "merged",
            Language::Python,
            "json + [sys, open]",
        ));

    let report = python
        .engine
        .build(&pipeline, &BuildOptions::default())
        .expect("build");

    assert!(report.is_complete(), "{:?}", report.nodes);
    assert_eq!(python.value("merged"), json!([1, 2, 3]));
}

#[rstest]
fn python_exceptions_fail_the_node(python: Option<Python>) {
    let Some(python) = python else { return };
    let pipeline = python
        .pipeline()
        .with(Derivation::expr("broken", Language::Python, "1 / 0"))
        .with(Derivation::expr("after", Language::Jinja, "broken + 1"));

    let report = python
        .engine
        .build(&pipeline, &BuildOptions::default())
        .expect("build");

    let broken = report.node("broken").expect("broken");
    assert_eq!(broken.status, NodeStatus::Failed);
    assert!(
        broken
            .error
            .as_deref()
            .is_some_and(|message| message.contains("ZeroDivisionError")),
        "{:?}",
        broken.error
    );
    assert_eq!(report.status("after"), Some(NodeStatus::Blocked));
}

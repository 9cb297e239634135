//! Build behaviour across runs: caching, minimal rebuilds, failures, and
//! cancellation.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use polyflow::build_log::{NodeStatus, Outcome};
use polyflow::derivation::{Derivation, Pipeline};
use polyflow::engine::{BuildOptions, BuildReport, Engine};
use polyflow::fingerprint::FingerprintEngine;
use polyflow::graph::Dag;
use polyflow::language::Language;
use rstest::rstest;
use serde_json::json;
use test_support::{ScriptedRuntime, registry_with, scripted_engine};

fn scenario(a: &str) -> Pipeline {
    Pipeline::new(".")
        .with(Derivation::expr("a", Language::Jinja, a))
        .with(Derivation::expr(
            "b",
            Language::Python,
            "a | map('mul', 2) | list",
        ))
        .with(Derivation::expr("c", Language::Jinja, "b | sum"))
}

fn statuses(report: &BuildReport) -> Vec<(&str, NodeStatus)> {
    report
        .nodes
        .iter()
        .map(|node| (node.name.as_str(), node.status))
        .collect()
}

fn value_of(engine: &Engine, name: &str) -> serde_json::Value {
    engine
        .load(name, None)
        .expect("load")
        .artifact
        .to_json()
        .expect("json")
}

#[test]
fn doubling_scenario_rebuilds_then_reuses() {
    let (engine, python) = scripted_engine();
    let options = BuildOptions::default();

    let first = engine.build(&scenario("[1, 2, 3]"), &options).expect("first");
    assert_eq!(first.outcome, Some(Outcome::Complete));
    assert_eq!(value_of(&engine, "b"), json!([2, 4, 6]));
    assert_eq!(value_of(&engine, "c"), json!(12));

    let second = engine
        .build(&scenario("[1, 2, 3, 4]"), &options)
        .expect("second");
    assert!(second.nodes.iter().all(|n| n.status == NodeStatus::Rebuilt));
    assert_eq!(value_of(&engine, "c"), json!(20));

    let third = engine
        .build(&scenario("[1, 2, 3, 4]"), &options)
        .expect("third");
    assert!(third.nodes.iter().all(|n| n.status == NodeStatus::Reused));
    assert_eq!(python.calls("b"), 2);
}

#[test]
fn editing_a_leaf_rebuilds_only_that_leaf() {
    let (engine, python) = scripted_engine();
    let options = BuildOptions::default();
    engine.build(&scenario("[1, 2, 3]"), &options).expect("first");

    let edited = Pipeline::new(".")
        .with(Derivation::expr("a", Language::Jinja, "[1, 2, 3]"))
        .with(Derivation::expr(
            "b",
            Language::Python,
            "a | map('mul', 2) | list",
        ))
        .with(Derivation::expr("c", Language::Jinja, "b | length"));
    let report = engine.build(&edited, &options).expect("second");
    assert_eq!(
        statuses(&report),
        [
            ("a", NodeStatus::Reused),
            ("b", NodeStatus::Reused),
            ("c", NodeStatus::Rebuilt),
        ]
    );
    assert_eq!(python.calls("b"), 1);
    assert_eq!(value_of(&engine, "c"), json!(3));
}

#[test]
fn fingerprints_ignore_declaration_order_and_description() {
    let forward = scenario("[1, 2, 3]");
    let mut reversed = Pipeline::new(".");
    for derivation in forward.derivations().iter().rev() {
        reversed.push(derivation.clone().with_description("same thing"));
    }
    let fingerprint_of = |pipeline: &Pipeline| {
        let dag = Dag::from_pipeline(pipeline).expect("dag");
        let fingerprints = FingerprintEngine::new(&dag).compute().expect("fingerprints");
        let mut named: Vec<(String, String)> = dag
            .nodes()
            .iter()
            .filter_map(|node| {
                let fp = fingerprints.get(node.id())?;
                Some((node.name().to_owned(), fp.as_str().to_owned()))
            })
            .collect();
        named.sort();
        named
    };
    assert_eq!(fingerprint_of(&forward), fingerprint_of(&reversed));
}

#[rstest]
#[case(1)]
#[case(4)]
fn identical_siblings_evaluate_once(#[case] jobs: usize) {
    let python =
        Arc::new(ScriptedRuntime::new(Language::Python).with_delay(Duration::from_millis(20)));
    let engine = Engine::in_memory(registry_with(&python));
    let pipeline = Pipeline::new(".")
        .with(Derivation::expr("a", Language::Jinja, "[1, 2]"))
        .with(Derivation::expr("left", Language::Python, "a | sum"))
        .with(Derivation::expr("right", Language::Python, "a | sum"));
    let options = BuildOptions {
        jobs,
        ..BuildOptions::default()
    };
    let report = engine.build(&pipeline, &options).expect("build");
    assert_eq!(report.outcome, Some(Outcome::Complete));
    assert_eq!(python.total_calls(), 1);
    let left = report.node("left").expect("left");
    let right = report.node("right").expect("right");
    assert_eq!(left.fingerprint, right.fingerprint);
    let mut seen = [left.status, right.status];
    seen.sort_by_key(|status| status.as_str());
    assert_eq!(seen, [NodeStatus::Rebuilt, NodeStatus::Reused]);
}

#[test]
fn failures_block_only_their_descendants() {
    let python = Arc::new(ScriptedRuntime::new(Language::Python).failing("b"));
    let engine = Engine::in_memory(registry_with(&python));
    let pipeline = scenario("[1, 2, 3]").with(Derivation::expr("d", Language::Jinja, "a | length"));
    let report = engine.build(&pipeline, &BuildOptions::default()).expect("build");

    assert_eq!(report.outcome, Some(Outcome::Failed));
    assert_eq!(report.status("a"), Some(NodeStatus::Rebuilt));
    assert_eq!(report.status("b"), Some(NodeStatus::Failed));
    assert_eq!(report.status("c"), Some(NodeStatus::Blocked));
    assert_eq!(report.status("d"), Some(NodeStatus::Rebuilt));
    let error = report.node("b").and_then(|n| n.error.clone()).unwrap_or_default();
    assert!(error.contains("scripted failure"), "{error}");

    let history = engine.history().expect("history");
    assert_eq!(history.len(), 1);
    let entry = history.entries().next().expect("entry").expect("readable");
    assert_eq!(entry.outcome, Outcome::Failed);
    assert_eq!(entry.node("c").map(|n| n.status), Some(NodeStatus::Blocked));
}

#[test]
fn cancelling_mid_run_interrupts_the_build() {
    let python = Arc::new(ScriptedRuntime::new(Language::Python).gated());
    let engine = Engine::in_memory(registry_with(&python));
    let pipeline = Pipeline::new(".")
        .with(Derivation::expr("a", Language::Python, "[1, 2]"))
        .with(Derivation::expr("b", Language::Jinja, "a | sum"))
        .with(Derivation::expr("c", Language::Jinja, "b + 1"));
    let options = BuildOptions {
        jobs: 1,
        ..BuildOptions::default()
    };

    let watcher = {
        let python = Arc::clone(&python);
        let cancel = options.cancel.clone();
        thread::spawn(move || {
            while python.calls("a") == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            cancel.cancel();
            python.open();
        })
    };
    let report = engine.build(&pipeline, &options).expect("build");
    watcher.join().expect("watcher");

    assert_eq!(report.outcome, Some(Outcome::Interrupted));
    assert_eq!(report.status("a"), Some(NodeStatus::Rebuilt));
    assert_eq!(report.status("b"), Some(NodeStatus::Cancelled));
    assert_eq!(report.status("c"), Some(NodeStatus::Cancelled));
    let history = engine.history().expect("history");
    assert_eq!(
        history.iter().next().map(|summary| summary.outcome),
        Some(Outcome::Interrupted)
    );
}

#[test]
fn plan_reports_cached_and_pending_nodes() {
    let (engine, python) = scripted_engine();
    engine
        .build(&scenario("[1, 2, 3]"), &BuildOptions::default())
        .expect("build");
    let plan_only = BuildOptions {
        build: false,
        ..BuildOptions::default()
    };
    let plan = engine
        .build(&scenario("[5]"), &plan_only)
        .expect("plan");
    assert_eq!(plan.outcome, None);
    assert!(plan.nodes.iter().all(|n| n.status == NodeStatus::Pending));
    let cached = engine
        .build(&scenario("[1, 2, 3]"), &plan_only)
        .expect("plan");
    assert!(cached.nodes.iter().all(|n| n.status == NodeStatus::Reused));
    assert_eq!(python.calls("b"), 1);
    assert_eq!(engine.history().expect("history").len(), 1);
}

//! Serializer and deserializer hooks between languages.

use polyflow::artifact::Format;
use polyflow::ast::HookSpec;
use polyflow::build_log::{NodeStatus, Outcome};
use polyflow::derivation::{Derivation, Pipeline};
use polyflow::engine::BuildOptions;
use polyflow::language::Language;
use rstest::rstest;
use serde_json::json;
use test_support::scripted_engine;

fn hooked(serializer: &str, deserializer: &str) -> Pipeline {
    Pipeline::new(".")
        .with(
            Derivation::expr("a", Language::Jinja, "[1, 2, 3]").with_serializer(serializer),
        )
        .with(
            Derivation::expr("b", Language::Python, "a | sum")
                .with_deserializers(HookSpec::All(deserializer.to_owned())),
        )
}

#[test]
fn json_hook_round_trips_values() {
    let (engine, _python) = scripted_engine();
    let report = engine
        .build(&hooked("json", "json"), &BuildOptions::default())
        .expect("build");
    assert_eq!(report.outcome, Some(Outcome::Complete));

    let stored = engine.read("a", None).expect("read");
    assert_eq!(*stored.artifact.format(), Format::json());
    assert_eq!(stored.artifact.to_json().expect("json"), json!([1, 2, 3]));
    let b = engine.load("b", None).expect("load");
    assert_eq!(b.artifact.to_json().expect("json"), json!(6));
}

#[test]
fn encoded_artifacts_decode_on_load() {
    let (engine, _python) = scripted_engine();
    engine
        .build(&hooked("json", "json"), &BuildOptions::default())
        .expect("build");
    let native = engine.load("a", Some(Language::Python)).expect("load");
    assert_eq!(*native.artifact.format(), Format::Native(Language::Python));
    assert_eq!(native.artifact.to_json().expect("json"), json!([1, 2, 3]));
}

#[rstest]
#[case::lines_read_as_json("lines", "json")]
#[case::json_read_as_text("json", "text")]
fn mismatched_hooks_fail_the_consumer(#[case] serializer: &str, #[case] deserializer: &str) {
    let (engine, python) = scripted_engine();
    let report = engine
        .build(&hooked(serializer, deserializer), &BuildOptions::default())
        .expect("build");
    assert_eq!(report.status("a"), Some(NodeStatus::Rebuilt));
    assert_eq!(report.status("b"), Some(NodeStatus::Failed));
    assert_eq!(python.calls("b"), 0);
}

#[test]
fn hooks_change_the_fingerprint() {
    let (engine, _python) = scripted_engine();
    let options = BuildOptions::default();
    let plain = engine
        .build(&hooked("json", "json"), &options)
        .expect("build");
    let relabelled = engine
        .build(&hooked("lines", "lines"), &options)
        .expect("build");
    let fp = |report: &polyflow::engine::BuildReport| {
        report.node("a").map(|node| node.fingerprint.clone())
    };
    assert_ne!(fp(&plain), fp(&relabelled));
}

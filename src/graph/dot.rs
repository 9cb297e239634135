//! Graphviz DOT rendering for [`Dag`].
//!
//! Nodes are emitted in build order and edges sorted by endpoint names so the
//! output is stable across runs and suitable for snapshot comparison.

use std::fmt::{self, Display, Formatter, Write};

use itertools::Itertools;

use super::{Dag, Node};

pub(super) fn render(dag: &Dag) -> String {
    let mut out = String::from("digraph pipeline {\n  rankdir=LR;\n");
    for node in dag.build_order() {
        if let Err(err) = write!(out, "{}", DisplayNode(node)) {
            debug_assert!(false, "write DOT node failed: {err}");
        }
    }
    let edges = dag
        .nodes()
        .iter()
        .flat_map(|node| {
            node.upstream()
                .iter()
                .filter_map(|&up| dag.node(up))
                .map(move |up| (up.name(), node.name()))
        })
        .sorted();
    for (from, to) in edges {
        if let Err(err) = writeln!(out, "  {} -> {};", quote(from), quote(to)) {
            debug_assert!(false, "write DOT edge failed: {err}");
        }
    }
    out.push_str("}\n");
    out
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

struct DisplayNode<'a>(&'a Node);

impl Display for DisplayNode<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let derivation = self.0.derivation();
        writeln!(
            f,
            "  {} [label=\"{}\\n({})\", shape={}];",
            quote(derivation.name()),
            derivation.name(),
            derivation.language(),
            if self.0.is_source() { "box" } else { "ellipse" },
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::derivation::{Derivation, Pipeline};
    use crate::graph::Dag;
    use crate::language::Language;

    #[test]
    fn renders_nodes_and_edges_deterministically() {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("a", Language::Jinja, "[1, 2]"))
            .with(Derivation::convert("b", Language::Python, "a"))
            .with(Derivation::expr("c", Language::Jinja, "a + b"));
        let dag = Dag::from_pipeline(&pipeline).expect("dag");
        let expected = concat!(
            "digraph pipeline {\n",
            "  rankdir=LR;\n",
            "  \"a\" [label=\"a\\n(jinja)\", shape=box];\n",
            "  \"b\" [label=\"b\\n(python)\", shape=ellipse];\n",
            "  \"c\" [label=\"c\\n(jinja)\", shape=ellipse];\n",
            "  \"a\" -> \"b\";\n",
            "  \"a\" -> \"c\";\n",
            "  \"b\" -> \"c\";\n",
            "}\n",
        );
        assert_eq!(dag.to_dot(), expected);
    }
}

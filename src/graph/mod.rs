//! Dependency graph construction.
//!
//! [`Dag::from_pipeline`] resolves every derivation's upstream references
//! (explicit `inputs`, the source of a `convert` body, and identifiers found in
//! `expr` bodies that name another derivation), rejects cycles, and fixes a
//! deterministic build order. Construction is a pure transformation: nothing
//! is read from disk and nothing is executed.
//!
//! # Examples
//!
//! ```
//! use polyflow::derivation::{Derivation, Pipeline};
//! use polyflow::graph::Dag;
//! use polyflow::language::Language;
//!
//! let pipeline = Pipeline::new(".")
//!     .with(Derivation::expr("total", Language::Jinja, "values | sum"))
//!     .with(Derivation::expr("values", Language::Jinja, "[1, 2, 3]"));
//! let dag = Dag::from_pipeline(&pipeline).expect("acyclic");
//! let order: Vec<&str> = dag.build_order().map(|n| n.name()).collect();
//! assert_eq!(order, ["values", "total"]);
//! ```

mod cycle;
mod dot;
pub(crate) mod references;

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use miette::Diagnostic;
use thiserror::Error;

use crate::derivation::{Body, Derivation, Pipeline};
use crate::language::Language;
use cycle::Traversal;

/// Index of a node in declaration order.
pub type NodeId = usize;

/// Errors raised while assembling the dependency graph.
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum GraphError {
    /// The upstream references form a cycle.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    #[diagnostic(
        code(polyflow::graph::cyclic_dependency),
        help("remove one of the references so the derivations form a DAG")
    )]
    CyclicDependency {
        /// Names along the cycle; the first name is repeated at the end.
        cycle: Vec<String>,
    },

    /// A derivation references a name that is not declared.
    #[error("derivation '{derivation}' references unknown derivation '{reference}'")]
    #[diagnostic(code(polyflow::graph::unresolved_reference))]
    UnresolvedReference {
        /// The referencing derivation.
        derivation: String,
        /// The missing name.
        reference: String,
    },

    /// Two derivations share a name.
    #[error("derivation name '{name}' is declared more than once")]
    #[diagnostic(code(polyflow::graph::duplicate_name))]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A derivation name is not a valid identifier.
    #[error("derivation name '{name}' is not a valid identifier")]
    #[diagnostic(
        code(polyflow::graph::invalid_name),
        help("names must match [A-Za-z_][A-Za-z0-9_]* so runtimes can bind them")
    )]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// An input's name cannot be bound in the consumer's runtime.
    #[error("derivation '{derivation}' cannot bind input '{input}': the name is reserved in {language}")]
    #[diagnostic(
        code(polyflow::graph::reserved_name),
        help("rename the upstream derivation")
    )]
    ReservedName {
        /// The consuming derivation.
        derivation: String,
        /// The upstream name it would bind.
        input: String,
        /// The consumer's language.
        language: Language,
    },

    /// A name was looked up that is not part of the graph.
    #[error("no derivation named '{name}' in the pipeline")]
    #[diagnostic(code(polyflow::graph::unknown_derivation))]
    UnknownDerivation {
        /// The missing name.
        name: String,
    },
}

/// A derivation with resolved edges.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    derivation: Derivation,
    upstream: Vec<NodeId>,
    downstream: Vec<NodeId>,
}

impl Node {
    /// Position of the node in declaration order.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The underlying derivation.
    #[must_use]
    pub const fn derivation(&self) -> &Derivation {
        &self.derivation
    }

    /// Shorthand for the derivation name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.derivation.name()
    }

    /// Upstream node ids in declaration order.
    #[must_use]
    pub fn upstream(&self) -> &[NodeId] {
        &self.upstream
    }

    /// Downstream node ids in declaration order.
    #[must_use]
    pub fn downstream(&self) -> &[NodeId] {
        &self.downstream
    }

    /// Whether the node has no upstream and must materialise itself.
    #[must_use]
    pub fn is_source(&self) -> bool {
        self.upstream.is_empty()
    }
}

/// Ancestors and descendants of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    /// The traced derivation.
    pub name: String,
    /// Every transitive upstream, in build order.
    pub ancestors: Vec<String>,
    /// Every transitive downstream, in build order.
    pub descendants: Vec<String>,
}

/// Directed acyclic graph of derivations.
#[derive(Debug, Clone)]
pub struct Dag {
    root: Utf8PathBuf,
    nodes: Vec<Node>,
    order: Vec<NodeId>,
    index: IndexMap<String, NodeId>,
}

impl Dag {
    /// Build the graph for `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] when a name is invalid or duplicated, a
    /// reference cannot be resolved, or the references form a cycle.
    pub fn from_pipeline(pipeline: &Pipeline) -> Result<Self, GraphError> {
        let index = Self::index_names(pipeline)?;
        let upstream = pipeline
            .derivations()
            .iter()
            .map(|derivation| resolve_upstream(derivation, &index))
            .collect::<Result<Vec<_>, _>>()?;
        for (derivation, deps) in pipeline.derivations().iter().zip(&upstream) {
            check_bindings(derivation, deps, pipeline)?;
        }

        let order = match cycle::analyse(&upstream) {
            Traversal::Ordered(order) => order,
            Traversal::Cycle(ids) => {
                let cycle = ids
                    .into_iter()
                    .filter_map(|id| pipeline.derivations().get(id))
                    .map(|d| d.name().to_owned())
                    .collect();
                return Err(GraphError::CyclicDependency { cycle });
            }
        };

        let mut downstream: Vec<Vec<NodeId>> = vec![Vec::new(); upstream.len()];
        for (id, deps) in upstream.iter().enumerate() {
            for &dep in deps {
                if let Some(slot) = downstream.get_mut(dep) {
                    slot.push(id);
                }
            }
        }

        let nodes = pipeline
            .derivations()
            .iter()
            .cloned()
            .zip(upstream.into_iter().zip(downstream))
            .enumerate()
            .map(|(id, (derivation, (upstream, downstream)))| Node {
                id,
                derivation,
                upstream,
                downstream,
            })
            .collect();

        tracing::debug!(nodes = index.len(), "derivation graph assembled");
        Ok(Self {
            root: pipeline.root().to_owned(),
            nodes,
            order,
            index,
        })
    }

    fn index_names(pipeline: &Pipeline) -> Result<IndexMap<String, NodeId>, GraphError> {
        let mut index = IndexMap::with_capacity(pipeline.derivations().len());
        for (id, derivation) in pipeline.derivations().iter().enumerate() {
            let name = derivation.name();
            if !references::is_identifier(name) {
                return Err(GraphError::InvalidName {
                    name: name.to_owned(),
                });
            }
            if index.insert(name.to_owned(), id).is_some() {
                return Err(GraphError::DuplicateName {
                    name: name.to_owned(),
                });
            }
        }
        Ok(index)
    }

    /// Root directory of the pipeline.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node id by derivation name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    /// Node ids in build order.
    #[must_use]
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes in build order.
    pub fn build_order(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|&id| self.nodes.get(id))
    }

    /// Every node reachable downstream of `id`, excluding `id`.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.closure(id, Node::downstream)
    }

    /// Every node reachable upstream of `id`, excluding `id`.
    #[must_use]
    pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.closure(id, Node::upstream)
    }

    fn closure(&self, id: NodeId, edges: fn(&Node) -> &[NodeId]) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<NodeId> = self.node(id).map(edges).unwrap_or_default().to_vec();
        while let Some(next) = pending.pop() {
            if seen.insert(next)
                && let Some(node) = self.node(next)
            {
                pending.extend_from_slice(edges(node));
            }
        }
        seen
    }

    /// Ancestors and descendants of the named derivation.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDerivation`] when `name` is not declared.
    pub fn trace(&self, name: &str) -> Result<Lineage, GraphError> {
        let id = self
            .id_of(name)
            .ok_or_else(|| GraphError::UnknownDerivation {
                name: name.to_owned(),
            })?;
        let ancestors = self.ancestors(id);
        let descendants = self.descendants(id);
        let in_order = |set: &BTreeSet<NodeId>| -> Vec<String> {
            self.build_order()
                .filter(|node| set.contains(&node.id))
                .map(|node| node.name().to_owned())
                .collect()
        };
        Ok(Lineage {
            name: name.to_owned(),
            ancestors: in_order(&ancestors),
            descendants: in_order(&descendants),
        })
    }

    /// Render the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        dot::render(self)
    }
}

/// Refuse upstream names the consumer's runtime cannot bind.
///
/// `convert` bodies hand the artifact over without binding it.
fn check_bindings(
    derivation: &Derivation,
    deps: &[NodeId],
    pipeline: &Pipeline,
) -> Result<(), GraphError> {
    if matches!(derivation.body(), Body::Convert { .. }) {
        return Ok(());
    }
    let language = derivation.language();
    let reserved = deps
        .iter()
        .filter_map(|&id| pipeline.derivations().get(id))
        .find(|input| language.reserves(input.name()));
    match reserved {
        Some(input) => Err(GraphError::ReservedName {
            derivation: derivation.name().to_owned(),
            input: input.name().to_owned(),
            language,
        }),
        None => Ok(()),
    }
}

/// Resolve the upstream ids of `derivation`, preserving declaration order.
fn resolve_upstream(
    derivation: &Derivation,
    index: &IndexMap<String, NodeId>,
) -> Result<Vec<NodeId>, GraphError> {
    let unresolved = |reference: &str| GraphError::UnresolvedReference {
        derivation: derivation.name().to_owned(),
        reference: reference.to_owned(),
    };

    let mut ids = BTreeSet::new();
    for input in derivation.inputs() {
        ids.insert(*index.get(input).ok_or_else(|| unresolved(input))?);
    }
    match derivation.body() {
        Body::Convert { from } => {
            ids.insert(*index.get(from).ok_or_else(|| unresolved(from))?);
        }
        Body::Expr { source } => {
            let scanned = references::scan_identifiers(source, derivation.language());
            ids.extend(
                scanned
                    .into_iter()
                    .filter(|ident| *ident != derivation.name())
                    .filter_map(|ident| index.get(ident).copied()),
            );
        }
        Body::Import { .. } => {}
    }
    Ok(ids.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn chain() -> Pipeline {
        Pipeline::new(".")
            .with(Derivation::expr("a", Language::Jinja, "[1, 2, 3]"))
            .with(Derivation::convert("b", Language::Python, "a"))
            .with(Derivation::expr("c", Language::Jinja, "b | sum"))
            .with(Derivation::expr("d", Language::Jinja, "'unrelated'"))
    }

    #[rstest]
    fn resolves_edges_from_all_reference_kinds(chain: Pipeline) {
        let dag = Dag::from_pipeline(&chain).expect("dag");
        let b = dag.node(1).expect("b");
        assert_eq!(b.upstream(), [0]);
        assert_eq!(b.downstream(), [2]);
        assert!(dag.node(0).expect("a").is_source());
        assert!(dag.node(3).expect("d").is_source());
    }

    #[rstest]
    fn traces_lineage(chain: Pipeline) {
        let dag = Dag::from_pipeline(&chain).expect("dag");
        let lineage = dag.trace("b").expect("trace");
        assert_eq!(lineage.ancestors, ["a"]);
        assert_eq!(lineage.descendants, ["c"]);
        assert!(matches!(
            dag.trace("zzz"),
            Err(GraphError::UnknownDerivation { .. })
        ));
    }

    #[test]
    fn explicit_input_must_exist() {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("a", Language::Shell, "echo hi").with_inputs(["ghost"]));
        assert_eq!(
            Dag::from_pipeline(&pipeline).expect_err("unresolved"),
            GraphError::UnresolvedReference {
                derivation: "a".into(),
                reference: "ghost".into(),
            }
        );
    }

    #[test]
    fn convert_source_must_exist() {
        let pipeline = Pipeline::new(".").with(Derivation::convert("b", Language::R, "a"));
        assert!(matches!(
            Dag::from_pipeline(&pipeline),
            Err(GraphError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn self_reference_in_expression_is_ignored() {
        let pipeline =
            Pipeline::new(".").with(Derivation::expr("total", Language::Python, "total = 3"));
        let dag = Dag::from_pipeline(&pipeline).expect("dag");
        assert!(dag.node(0).expect("total").is_source());
    }

    #[test]
    fn shell_flags_are_not_references() {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("x", Language::Shell, "seq 10 | head -n 3"))
            .with(Derivation::expr("n", Language::Jinja, "x | length"));
        let dag = Dag::from_pipeline(&pipeline).expect("dag");
        assert!(dag.node(0).expect("x").is_source());
        assert_eq!(dag.node(1).expect("n").upstream(), [0]);
    }

    #[test]
    fn shell_expansions_are_references() {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("raw", Language::Jinja, "'text'"))
            .with(Derivation::expr("count", Language::Shell, "wc -c < \"${raw}\""));
        let dag = Dag::from_pipeline(&pipeline).expect("dag");
        assert_eq!(dag.node(1).expect("count").upstream(), [0]);
    }

    #[rstest]
    #[case(Language::Shell, "PATH")]
    #[case(Language::Python, "class")]
    #[case(Language::R, "NULL")]
    fn rejects_inputs_reserved_by_the_consumer(#[case] language: Language, #[case] name: &str) {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr(name, Language::Jinja, "'hello'"))
            .with(Derivation::expr("out", language, "1").with_inputs([name]));
        assert_eq!(
            Dag::from_pipeline(&pipeline).expect_err("reserved"),
            GraphError::ReservedName {
                derivation: "out".into(),
                input: name.into(),
                language,
            }
        );
    }

    #[test]
    fn reserved_names_are_fine_for_other_consumers() {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("PATH", Language::Jinja, "'hello'"))
            .with(Derivation::expr("upper", Language::Python, "PATH.upper()"))
            .with(Derivation::convert("as_shell", Language::Shell, "PATH"));
        let dag = Dag::from_pipeline(&pipeline).expect("dag");
        assert_eq!(dag.node(1).expect("upper").upstream(), [0]);
    }

    #[test]
    fn reports_cycles_by_name() {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("x", Language::Jinja, "y + 1"))
            .with(Derivation::expr("y", Language::Jinja, "x + 1"));
        assert_eq!(
            Dag::from_pipeline(&pipeline).expect_err("cycle"),
            GraphError::CyclicDependency {
                cycle: vec!["x".into(), "y".into(), "x".into()],
            }
        );
    }

    #[rstest]
    #[case("a-b", GraphError::InvalidName { name: "a-b".into() })]
    #[case("a", GraphError::DuplicateName { name: "a".into() })]
    fn rejects_bad_names(#[case] second: &str, #[case] expected: GraphError) {
        let pipeline = Pipeline::new(".")
            .with(Derivation::expr("a", Language::Jinja, "1"))
            .with(Derivation::expr(second, Language::Jinja, "2"));
        assert_eq!(Dag::from_pipeline(&pipeline).expect_err("bad name"), expected);
    }

    #[test]
    fn build_order_is_independent_of_unrelated_reordering() {
        let forward = Pipeline::new(".")
            .with(Derivation::expr("a", Language::Jinja, "1"))
            .with(Derivation::expr("b", Language::Jinja, "a + 1"));
        let backward = Pipeline::new(".")
            .with(Derivation::expr("b", Language::Jinja, "a + 1"))
            .with(Derivation::expr("a", Language::Jinja, "1"));
        for pipeline in [forward, backward] {
            let dag = Dag::from_pipeline(&pipeline).expect("dag");
            let names: Vec<&str> = dag.build_order().map(Node::name).collect();
            assert_eq!(names, ["a", "b"]);
        }
    }
}

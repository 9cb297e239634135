//! Cycle detection and topological ordering for the derivation graph.

use super::NodeId;

/// Tracks the visitation state of a node during traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum VisitState {
    Visiting,
    Visited,
}

/// Outcome of a full traversal.
pub(crate) enum Traversal {
    /// Nodes in dependency order (every node after its upstreams).
    Ordered(Vec<NodeId>),
    /// A cycle, first node repeated at the end.
    Cycle(Vec<NodeId>),
}

/// Depth-first traversal over `upstream` adjacency lists.
///
/// Roots are visited in index (declaration) order and so are each node's
/// upstreams, which makes the resulting order deterministic.
pub(crate) fn analyse(upstream: &[Vec<NodeId>]) -> Traversal {
    let mut walker = Walker::new(upstream);
    for node in 0..upstream.len() {
        if walker.is_visited(node) {
            continue;
        }
        if let Some(cycle) = walker.visit(node) {
            return Traversal::Cycle(canonicalize_cycle(cycle));
        }
    }
    Traversal::Ordered(walker.order)
}

struct Walker<'a> {
    upstream: &'a [Vec<NodeId>],
    stack: Vec<NodeId>,
    states: Vec<Option<VisitState>>,
    order: Vec<NodeId>,
}

impl<'a> Walker<'a> {
    fn new(upstream: &'a [Vec<NodeId>]) -> Self {
        Self {
            upstream,
            stack: Vec::new(),
            states: vec![None; upstream.len()],
            order: Vec::with_capacity(upstream.len()),
        }
    }

    fn is_visited(&self, node: NodeId) -> bool {
        matches!(self.states.get(node), Some(Some(VisitState::Visited)))
    }

    fn visit(&mut self, node: NodeId) -> Option<Vec<NodeId>> {
        match self.states.get(node).copied().flatten() {
            Some(VisitState::Visited) => return None,
            Some(VisitState::Visiting) => {
                let idx = self
                    .stack
                    .iter()
                    .position(|n| *n == node)
                    .unwrap_or_else(|| {
                        debug_assert!(false, "visiting node must be on the stack");
                        0
                    });
                let mut cycle: Vec<NodeId> = self.stack.iter().skip(idx).copied().collect();
                cycle.push(node);
                return Some(cycle);
            }
            None => self.set_state(node, VisitState::Visiting),
        }

        self.stack.push(node);
        let deps = self.upstream.get(node).map_or(&[][..], Vec::as_slice);
        for &dep in deps {
            if let Some(cycle) = self.visit(dep) {
                return Some(cycle);
            }
        }
        self.stack.pop();
        self.set_state(node, VisitState::Visited);
        self.order.push(node);
        None
    }

    fn set_state(&mut self, node: NodeId, state: VisitState) {
        if let Some(slot) = self.states.get_mut(node) {
            *slot = Some(state);
        }
    }
}

/// Rotate a cycle so it starts at its smallest node, keeping the closing
/// repetition consistent.
fn canonicalize_cycle(mut cycle: Vec<NodeId>) -> Vec<NodeId> {
    if cycle.len() < 2 {
        return cycle;
    }
    let len = cycle.len() - 1;
    let start = cycle
        .iter()
        .take(len)
        .enumerate()
        .min_by(|(_, a), (_, b)| a.cmp(b))
        .map_or(0, |(idx, _)| idx);
    let (prefix, suffix) = cycle.split_at_mut(len);
    prefix.rotate_left(start);
    if let (Some(first), Some(slot)) = (prefix.first().copied(), suffix.first_mut()) {
        *slot = first;
    }
    cycle
}

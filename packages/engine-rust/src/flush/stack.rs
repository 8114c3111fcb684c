//! Flush stack construction.
//!
//! Linearizes an [`ObjectGraph`] into the order rows must reach their stores.
//! Every edge of the graph records where the foreign key of its relation
//! lives; that side decides which end of the edge has to exist first:
//!
//! | foreign key in | insert / update | delete |
//! |---|---|---|
//! | parent row | child, then parent | parent, then child |
//! | child row | parent, then child | child, then parent |
//! | join table | child, then parent | parent, then child |
//!
//! Cycles are broken where the depth-first walk first meets a node again.

use std::collections::HashSet;

use polystore_core::{ForeignKeySide, NodeId};

use crate::graph::ObjectGraph;

/// Kind of top-level operation a stack is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    Insert,
    Update,
    Delete,
}

/// LIFO sequence of node ids; popping yields write order.
#[derive(Debug, Default)]
pub struct FlushStack {
    entries: Vec<NodeId>,
}

impl FlushStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: NodeId) {
        self.entries.push(id);
    }

    pub fn pop(&mut self) -> Option<NodeId> {
        self.entries.pop()
    }

    #[must_use]
    pub fn peek(&self) -> Option<&NodeId> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in pop order.
    #[must_use]
    pub fn write_order(&self) -> Vec<NodeId> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn clear_flush_stack(&mut self) {
        self.entries.clear();
    }
}

/// Builds the flush stack for `graph`, starting from its head node.
#[must_use]
pub fn build_flush_stack(graph: &ObjectGraph, event: FlushEvent) -> FlushStack {
    let mut order = Vec::with_capacity(graph.len());
    let mut visited = HashSet::with_capacity(graph.len());

    visit(graph, graph.head_id(), event, &mut visited, &mut order);
    let rest: Vec<NodeId> = graph.nodes().map(|n| n.id().clone()).collect();
    for id in &rest {
        visit(graph, id, event, &mut visited, &mut order);
    }

    let mut stack = FlushStack::new();
    for id in order.into_iter().rev() {
        stack.push(id);
    }
    stack
}

/// Emits `id` after every node that must be written before it.
fn visit(
    graph: &ObjectGraph,
    id: &NodeId,
    event: FlushEvent,
    visited: &mut HashSet<NodeId>,
    order: &mut Vec<NodeId>,
) {
    if !visited.insert(id.clone()) {
        return;
    }
    let Some(node) = graph.node(id) else {
        return;
    };
    let delete = event == FlushEvent::Delete;

    for (child, link) in node.children() {
        let child_first = matches!(link.side, ForeignKeySide::Parent | ForeignKeySide::JoinTable);
        if child_first != delete {
            visit(graph, child, event, visited, order);
        }
    }
    for (parent, link) in node.parents() {
        let parent_first = link.side == ForeignKeySide::Child;
        if parent_first != delete {
            visit(graph, parent, event, visited, order);
        }
    }
    order.push(id.clone());
}

//! Topological execution order.
//!
//! Kahn's algorithm with the ready set ordered by node insertion index, so
//! the order is stable across runs and tests are deterministic.

use std::collections::BTreeSet;

use crate::error::{LatticeError, Result};
use crate::planner::{DependencyGraph, NodeKey};

pub struct ExecutionPlan {
    order: Vec<usize>,
}

impl ExecutionPlan {
    pub fn new(graph: &DependencyGraph) -> Result<Self> {
        let len = graph.len();
        let mut remaining: Vec<usize> = (0..len)
            .map(|i| graph.dependencies_of(i).len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
        for node in 0..len {
            for &dep in graph.dependencies_of(node) {
                dependents[dep].push(node);
            }
        }

        let mut ready: BTreeSet<usize> = (0..len).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(len);
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            for &dependent in &dependents[next] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        // Measure trees are finite and never self-referential, so a cycle
        // can only mean a bug upstream.
        if order.len() != len {
            return Err(LatticeError::Validation(
                "dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(Self { order })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Invokes `callback` once per node, dependencies first.
    pub fn execute<F>(&self, graph: &DependencyGraph, mut callback: F) -> Result<()>
    where
        F: FnMut(&NodeKey) -> Result<()>,
    {
        for &index in &self.order {
            callback(graph.node(index))?;
        }
        Ok(())
    }
}

//! Dependency graph over (scope, measure) nodes.

use std::collections::HashMap;

use crate::measure::{count_measure, grouping_measure, Measure};
use crate::planner::{prerequisites, CompiledQuery};
use crate::scope::QueryScope;

/// Identity of one plan node. Nodes with equal keys are fungible and merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub scope: QueryScope,
    pub measure: Measure,
}

/// Acyclic multi-rooted DAG of node keys, in stable insertion order.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<NodeKey>,
    index: HashMap<NodeKey, usize>,
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &NodeKey {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[NodeKey] {
        &self.nodes
    }

    /// Indices of the nodes `index` depends on.
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.index.contains_key(key)
    }

    fn add_node(&mut self, key: NodeKey) -> (usize, bool) {
        if let Some(&existing) = self.index.get(&key) {
            return (existing, false);
        }
        let index = self.nodes.len();
        self.index.insert(key.clone(), index);
        self.nodes.push(key);
        self.dependencies.push(Vec::new());
        (index, true)
    }

    fn add_dependency(&mut self, from: usize, dep: usize) {
        if !self.dependencies[from].contains(&dep) {
            self.dependencies[from].push(dep);
        }
    }
}

/// Closes the transitive requirement set of a compiled query into a DAG.
///
/// Seeds: the requested measures at the root scope, the count measure, and
/// one grouping indicator per rolled-up column. Terminates because measure
/// trees are finite and scope transformations are monotone.
pub fn build_graph(compiled: &CompiledQuery) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    let mut worklist: Vec<usize> = Vec::new();

    let seed = |graph: &mut DependencyGraph, worklist: &mut Vec<usize>, key: NodeKey| {
        let (index, added) = graph.add_node(key);
        if added {
            worklist.push(index);
        }
    };

    for measure in &compiled.measures {
        seed(
            &mut graph,
            &mut worklist,
            NodeKey {
                scope: compiled.scope.clone(),
                measure: measure.clone(),
            },
        );
    }
    seed(
        &mut graph,
        &mut worklist,
        NodeKey {
            scope: compiled.scope.clone(),
            measure: count_measure(),
        },
    );
    for column in compiled.scope.rolled_up_columns() {
        seed(
            &mut graph,
            &mut worklist,
            NodeKey {
                scope: compiled.scope.clone(),
                measure: grouping_measure(&column.name),
            },
        );
    }

    while let Some(current) = worklist.pop() {
        let key = graph.node(current).clone();
        for (scope, measures) in prerequisites(&key.measure, &key.scope) {
            for measure in measures {
                let dep_key = NodeKey {
                    scope: scope.clone(),
                    measure,
                };
                let (dep_index, added) = graph.add_node(dep_key);
                graph.add_dependency(current, dep_index);
                if added {
                    worklist.push(dep_index);
                }
            }
            ensure_scope_count(&mut graph, &mut worklist, &scope);
        }
    }

    graph
}

/// Every scope the plan touches is fetched with the count measure; register
/// it as a node so the prefetch pass sees the scope even when no other
/// primitive lands there.
fn ensure_scope_count(
    graph: &mut DependencyGraph,
    worklist: &mut Vec<usize>,
    scope: &QueryScope,
) {
    let key = NodeKey {
        scope: scope.clone(),
        measure: count_measure(),
    };
    let (index, added) = graph.add_node(key);
    if added {
        worklist.push(index);
    }
}

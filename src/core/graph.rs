//! KL-003: Output graph — arena of output resources, cycle detection, deploy order.
//!
//! Nodes live in one `Vec` in input order. LocalIDs are resolved to indices
//! once; every later pass works on `usize` adjacency lists.

use super::error::GraphError;
use super::types::OutputResource;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Validated, acyclic dependency graph for one deployment.
#[derive(Debug, Clone)]
pub struct OutputGraph {
    nodes: Vec<OutputResource>,
    index: FxHashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl OutputGraph {
    /// Build the graph from the union of every render's output resources.
    ///
    /// Rejects duplicate LocalIDs, dependencies on unknown LocalIDs, and cycles.
    pub fn build(resources: Vec<OutputResource>) -> Result<Self, GraphError> {
        let mut index = FxHashMap::default();
        index.reserve(resources.len());
        for (i, r) in resources.iter().enumerate() {
            if index.insert(r.local_id.clone(), i).is_some() {
                return Err(GraphError::DuplicateLocalId(r.local_id.clone()));
            }
        }

        let mut deps = Vec::with_capacity(resources.len());
        for r in &resources {
            let mut edges = Vec::with_capacity(r.dependencies.len());
            for dep in &r.dependencies {
                let j = *index
                    .get(dep)
                    .ok_or_else(|| GraphError::DanglingDependency {
                        local_id: r.local_id.clone(),
                        dependency: dep.clone(),
                    })?;
                if !edges.contains(&j) {
                    edges.push(j);
                }
            }
            deps.push(edges);
        }

        detect_cycle(&resources, &deps)?;
        let order = topo_order(&deps);

        Ok(Self {
            nodes: resources,
            index,
            deps,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by arena index.
    pub fn node(&self, i: usize) -> &OutputResource {
        &self.nodes[i]
    }

    pub fn get(&self, local_id: &str) -> Option<&OutputResource> {
        self.index.get(local_id).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, local_id: &str) -> Option<usize> {
        self.index.get(local_id).copied()
    }

    /// Arena indices this node depends on.
    pub fn dependency_indices(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    /// Nodes in deployment order.
    pub fn ordered(&self) -> impl Iterator<Item = &OutputResource> + '_ {
        self.order.iter().map(move |&i| &self.nodes[i])
    }

    /// LocalIDs in deployment order.
    pub fn order_ids(&self) -> Vec<&str> {
        self.ordered().map(|r| r.local_id.as_str()).collect()
    }

    /// Group nodes into waves. Every node's dependencies sit in an earlier
    /// wave, so all nodes of one wave may deploy concurrently.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.nodes.len()];
        let mut max_depth = 0;
        for &i in &self.order {
            let d = self.deps[i]
                .iter()
                .map(|&j| depth[j] + 1)
                .max()
                .unwrap_or(0);
            depth[i] = d;
            max_depth = max_depth.max(d);
        }
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let mut waves = vec![Vec::new(); max_depth + 1];
        for (i, &d) in depth.iter().enumerate() {
            waves[d].push(i);
        }
        waves
    }
}

/// Three-color DFS. A dependency on an in-progress node is a back edge.
fn detect_cycle(nodes: &[OutputResource], deps: &[Vec<usize>]) -> Result<(), GraphError> {
    let mut mark = vec![Mark::Unvisited; deps.len()];
    for start in 0..deps.len() {
        if mark[start] != Mark::Unvisited {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        mark[start] = Mark::InProgress;
        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if frame.1 < deps[node].len() {
                let next = deps[node][frame.1];
                frame.1 += 1;
                match mark[next] {
                    Mark::Unvisited => {
                        mark[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::InProgress => {
                        let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut path: Vec<String> = stack[from..]
                            .iter()
                            .map(|&(n, _)| nodes[n].local_id.clone())
                            .collect();
                        path.push(nodes[next].local_id.clone());
                        return Err(GraphError::Cycle { path });
                    }
                    Mark::Done => {}
                }
            } else {
                mark[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm; among ready nodes the lowest input index goes first.
fn topo_order(deps: &[Vec<usize>]) -> Vec<usize> {
    let n = deps.len();
    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); n];
    for (i, d) in deps.iter().enumerate() {
        for &j in d {
            dependents[j].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..n).filter(|&i| pending[i] == 0).map(Reverse).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &k in &dependents[i] {
            pending[k] -= 1;
            if pending[k] == 0 {
                ready.push(Reverse(k));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutputResourceType, Provider, ResourceIdentity};
    use proptest::prelude::*;

    fn node(id: &str, deps: &[&str]) -> OutputResource {
        OutputResource {
            local_id: id.to_string(),
            resource_type: OutputResourceType {
                kind: "test".into(),
                provider: Provider::Radius,
            },
            identity: ResourceIdentity::Ucp {
                id: format!("/planes/test/{}", id),
            },
            radius_managed: true,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            resource: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_kl003_linear_chain() {
        let g = OutputGraph::build(vec![
            node("c", &["b"]),
            node("b", &["a"]),
            node("a", &[]),
        ])
        .unwrap();
        assert_eq!(g.order_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_kl003_ties_keep_input_order() {
        let g = OutputGraph::build(vec![
            node("z", &[]),
            node("m", &[]),
            node("a", &[]),
        ])
        .unwrap();
        assert_eq!(g.order_ids(), vec!["z", "m", "a"]);
    }

    #[test]
    fn test_kl003_diamond() {
        let g = OutputGraph::build(vec![
            node("app", &["left", "right"]),
            node("right", &["base"]),
            node("left", &["base"]),
            node("base", &[]),
        ])
        .unwrap();
        assert_eq!(g.order_ids(), vec!["base", "right", "left", "app"]);
    }

    #[test]
    fn test_kl003_two_node_cycle_rejected() {
        let err = OutputGraph::build(vec![node("A", &["B"]), node("B", &["A"])]).unwrap_err();
        match err {
            GraphError::Cycle { path } => assert_eq!(path, vec!["A", "B", "A"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_kl003_self_cycle_rejected() {
        let err = OutputGraph::build(vec![node("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_kl003_cycle_behind_acyclic_prefix() {
        let err = OutputGraph::build(vec![
            node("root", &["x"]),
            node("x", &["y"]),
            node("y", &["z"]),
            node("z", &["x"]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["x".into(), "y".into(), "z".into(), "x".into()]
            }
        );
    }

    #[test]
    fn test_kl003_duplicate_rejected() {
        let err = OutputGraph::build(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateLocalId("a".into()));
    }

    #[test]
    fn test_kl003_dangling_rejected() {
        let err = OutputGraph::build(vec![node("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                local_id: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_kl003_duplicate_dependency_collapsed() {
        let g = OutputGraph::build(vec![node("a", &[]), node("b", &["a", "a"])]).unwrap();
        assert_eq!(g.dependency_indices(1), &[0]);
    }

    #[test]
    fn test_kl003_waves() {
        let g = OutputGraph::build(vec![
            node("db", &["server"]),
            node("server", &[]),
            node("cache", &[]),
            node("app", &["db", "cache"]),
        ])
        .unwrap();
        assert_eq!(g.waves(), vec![vec![1, 2], vec![0], vec![3]]);
    }

    #[test]
    fn test_kl003_empty_graph() {
        let g = OutputGraph::build(vec![]).unwrap();
        assert!(g.is_empty());
        assert!(g.waves().is_empty());
        assert!(g.order_ids().is_empty());
    }

    #[test]
    fn test_kl003_lookup() {
        let g = OutputGraph::build(vec![node("a", &[]), node("b", &["a"])]).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.index_of("b"), Some(1));
        assert_eq!(g.get("a").unwrap().local_id, "a");
        assert!(g.get("c").is_none());
    }

    fn arb_dag() -> impl Strategy<Value = Vec<OutputResource>> {
        (1usize..24)
            .prop_flat_map(|n| {
                proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n)
            })
            .prop_map(|raw| {
                raw.iter()
                    .enumerate()
                    .map(|(i, ds)| {
                        let deps: Vec<String> = if i == 0 {
                            Vec::new()
                        } else {
                            ds.iter().map(|d| format!("n{}", d % i)).collect()
                        };
                        let refs: Vec<&str> = deps.iter().map(String::as_str).collect();
                        node(&format!("n{}", i), &refs)
                    })
                    .collect::<Vec<_>>()
            })
            .prop_shuffle()
    }

    proptest! {
        #[test]
        fn test_kl003_order_respects_dependencies(nodes in arb_dag()) {
            let g = OutputGraph::build(nodes.clone()).unwrap();
            let ids = g.order_ids();
            prop_assert_eq!(ids.len(), nodes.len());
            for n in &nodes {
                let pos = ids.iter().position(|id| *id == n.local_id).unwrap();
                for dep in &n.dependencies {
                    let dpos = ids.iter().position(|id| id == dep).unwrap();
                    prop_assert!(dpos < pos);
                }
            }
        }

        #[test]
        fn test_kl003_roots_keep_input_order(nodes in arb_dag()) {
            let g = OutputGraph::build(nodes.clone()).unwrap();
            let ids = g.order_ids();
            let roots: Vec<&str> = nodes
                .iter()
                .filter(|n| n.dependencies.is_empty())
                .map(|n| n.local_id.as_str())
                .collect();
            let roots_in_order: Vec<&str> = ids
                .iter()
                .copied()
                .filter(|id| roots.contains(id))
                .collect();
            prop_assert_eq!(roots_in_order, roots);
        }

        #[test]
        fn test_kl003_waves_cover_all_nodes(nodes in arb_dag()) {
            let g = OutputGraph::build(nodes.clone()).unwrap();
            let waves = g.waves();
            let total: usize = waves.iter().map(Vec::len).sum();
            prop_assert_eq!(total, nodes.len());
            let mut wave_of = vec![0usize; nodes.len()];
            for (w, members) in waves.iter().enumerate() {
                for &i in members {
                    wave_of[i] = w;
                }
            }
            for i in 0..g.len() {
                for &d in g.dependency_indices(i) {
                    prop_assert!(wave_of[d] < wave_of[i]);
                }
            }
        }
    }
}

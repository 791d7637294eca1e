// SPDX-License-Identifier: MIT

//! Tarjan's strongly-connected-components algorithm, used to collapse
//! mutually-recursive code entities (classes that inherit from each
//! other, functions that call each other in a cycle) into a single unit
//! before topologically layering the summarization order.

use std::collections::{HashMap, HashSet};

struct TarjanState<'a> {
    edges: &'a HashMap<String, HashSet<String>>,
    index: HashMap<String, usize>,
    lowlink: HashMap<String, usize>,
    on_stack: HashSet<String>,
    stack: Vec<String>,
    next_index: usize,
    components: Vec<Vec<String>>,
}

/// Partitions `nodes` into strongly-connected components under `edges`
/// (`edges[n]` = the set of nodes `n` has an edge to). Singletons with no
/// self-loop are their own component. Component order is not
/// topologically meaningful; callers that need dependency order should
/// build a condensation graph over the returned components.
pub fn strongly_connected_components(
    nodes: &[String],
    edges: &HashMap<String, HashSet<String>>,
) -> Vec<Vec<String>> {
    let mut state = TarjanState {
        edges,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for node in nodes {
        if !state.index.contains_key(node) {
            strong_connect(&mut state, node);
        }
    }
    state.components
}

fn strong_connect(state: &mut TarjanState<'_>, v: &str) {
    state.index.insert(v.to_string(), state.next_index);
    state.lowlink.insert(v.to_string(), state.next_index);
    state.next_index += 1;
    state.stack.push(v.to_string());
    state.on_stack.insert(v.to_string());

    let successors: Vec<String> = state
        .edges
        .get(v)
        .map(|s| s.iter().cloned().collect())
        .unwrap_or_default();

    for w in &successors {
        if !state.index.contains_key(w) {
            strong_connect(state, w);
            let w_low = state.lowlink[w];
            let v_low = state.lowlink[v];
            state.lowlink.insert(v.to_string(), v_low.min(w_low));
        } else if state.on_stack.contains(w) {
            let w_index = state.index[w];
            let v_low = state.lowlink[v];
            state.lowlink.insert(v.to_string(), v_low.min(w_index));
        }
    }

    if state.lowlink[v] == state.index[v] {
        let mut component = Vec::new();
        loop {
            let Some(w) = state.stack.pop() else { break };
            state.on_stack.remove(&w);
            let is_v = w == v;
            component.push(w);
            if is_v {
                break;
            }
        }
        state.components.push(component);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &str)]) -> HashMap<String, HashSet<String>> {
        let mut map: HashMap<String, HashSet<String>> = HashMap::new();
        for (from, to) in pairs {
            map.entry(from.to_string()).or_default().insert(to.to_string());
        }
        map
    }

    #[test]
    fn acyclic_graph_has_one_component_per_node() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let e = edges(&[("a", "b"), ("b", "c")]);
        let components = strongly_connected_components(&nodes, &e);
        assert_eq!(components.len(), 3);
    }

    #[test]
    fn mutual_cycle_collapses_into_one_component() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let e = edges(&[("a", "b"), ("b", "a"), ("b", "c")]);
        let components = strongly_connected_components(&nodes, &e);
        let cyclic = components.iter().find(|c| c.len() > 1).expect("a cycle exists");
        let mut sorted = cyclic.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(components.len(), 2);
    }

    #[test]
    fn self_loop_is_its_own_single_node_component() {
        let nodes = vec!["a".to_string()];
        let e = edges(&[("a", "a")]);
        let components = strongly_connected_components(&nodes, &e);
        assert_eq!(components, vec![vec!["a".to_string()]]);
    }
}

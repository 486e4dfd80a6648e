//! Dependency graph over a task set
//!
//! The graph is an immutable value built once per scheduling round: forward
//! edges (task -> its dependencies), reverse edges (task -> its dependents),
//! and the set of ids participating in any cycle. Level assignment and
//! serial-chain detection are derived views.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::domain::Task;

/// Immutable dependency graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// All task ids in the graph
    pub all_task_ids: Vec<String>,

    /// task -> dependencies (in-graph edges only; edges to ids known to a
    /// wider fleet are kept in `external_dependencies`)
    pub adjacency: HashMap<String, Vec<String>>,

    /// task -> dependents
    pub reverse_adjacency: HashMap<String, Vec<String>>,

    /// task -> dependencies outside this task list but present in the
    /// caller-supplied global id set
    pub external_dependencies: HashMap<String, Vec<String>>,

    /// Ids participating in at least one cycle
    pub cyclic: HashSet<String>,
}

/// Three-color DFS marking
#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Build the graph from a task list.
    ///
    /// When `global_ids` is given, dependencies on ids outside the list but
    /// inside the global set are retained as external edges (used when
    /// scheduling a subset of a larger fleet). Dependencies on ids known to
    /// neither are dropped with a warning.
    pub fn build(tasks: &[Task], global_ids: Option<&HashSet<String>>) -> Self {
        debug!(task_count = tasks.len(), "DependencyGraph::build: called");
        let local: HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        let mut external: HashMap<String, Vec<String>> = HashMap::new();

        for task in tasks {
            adjacency.entry(task.task_id.clone()).or_default();
            reverse.entry(task.task_id.clone()).or_default();
        }

        for task in tasks {
            for dep in &task.dependencies {
                if local.contains(dep.as_str()) {
                    adjacency.get_mut(&task.task_id).expect("entry exists").push(dep.clone());
                    reverse.entry(dep.clone()).or_default().push(task.task_id.clone());
                } else if global_ids.is_some_and(|g| g.contains(dep)) {
                    external.entry(task.task_id.clone()).or_default().push(dep.clone());
                } else {
                    warn!(task_id = %task.task_id, dep = %dep, "Dropping dependency on unknown id");
                }
            }
        }

        let cyclic = find_cyclic_ids(&adjacency);
        if !cyclic.is_empty() {
            warn!(count = cyclic.len(), "Dependency graph contains cycles");
        }

        Self {
            all_task_ids: tasks.iter().map(|t| t.task_id.clone()).collect(),
            adjacency,
            reverse_adjacency: reverse,
            external_dependencies: external,
            cyclic,
        }
    }

    /// In-graph dependencies of a task
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// In-graph dependents of a task
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.reverse_adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Kahn-style level assignment on the acyclic portion.
    ///
    /// Returns `(levels, unschedulable)`: each level is a set of ids that may
    /// run in parallel; `unschedulable` holds ids reachable only through a
    /// cycle.
    pub fn execution_levels(&self) -> (Vec<Vec<String>>, Vec<String>) {
        let candidates: Vec<&str> = self
            .all_task_ids
            .iter()
            .map(|s| s.as_str())
            .filter(|id| !self.cyclic.contains(*id))
            .collect();

        let mut placed: HashSet<&str> = HashSet::new();
        let mut levels: Vec<Vec<String>> = Vec::new();

        loop {
            let mut level: Vec<&str> = candidates
                .iter()
                .copied()
                .filter(|id| !placed.contains(id))
                .filter(|id| self.dependencies_of(id).iter().all(|d| placed.contains(d.as_str())))
                .collect();

            if level.is_empty() {
                break;
            }
            level.sort();
            placed.extend(level.iter().copied());
            levels.push(level.into_iter().map(String::from).collect());
        }

        // Anything not placed depends (transitively) on a cycle
        let mut unschedulable: Vec<String> = self
            .all_task_ids
            .iter()
            .filter(|id| !placed.contains(id.as_str()))
            .cloned()
            .collect();
        unschedulable.sort();

        (levels, unschedulable)
    }

    /// Maximal linear chains: runs of tasks where each interior node has
    /// exactly one in-graph dependency and exactly one dependent. Returned
    /// chains are disjoint, ordered dependency-first, and at least two long.
    pub fn serial_chains(&self) -> Vec<Vec<String>> {
        let mut heads: Vec<&str> = self
            .all_task_ids
            .iter()
            .map(|s| s.as_str())
            .filter(|id| self.chain_next(id).is_some() && !self.has_chain_prev(id))
            .collect();
        heads.sort();

        let mut chains = Vec::new();
        for head in heads {
            let mut chain = vec![head.to_string()];
            let mut current = head;
            while let Some(next) = self.chain_next(current) {
                chain.push(next.to_string());
                current = next;
            }
            chains.push(chain);
        }
        chains
    }

    /// A -> B is a chain edge when B is A's only dependent and A is B's only
    /// dependency, and neither sits on a cycle.
    fn chain_next(&self, a: &str) -> Option<&str> {
        if self.cyclic.contains(a) {
            return None;
        }
        let dependents = self.dependents_of(a);
        if dependents.len() != 1 {
            return None;
        }
        let b = dependents[0].as_str();
        if self.cyclic.contains(b) || self.dependencies_of(b).len() != 1 {
            return None;
        }
        Some(b)
    }

    fn has_chain_prev(&self, b: &str) -> bool {
        let deps = self.dependencies_of(b);
        deps.len() == 1 && self.chain_next(deps[0].as_str()) == Some(b)
    }

    /// Transitive dependents of the given failed ids (the failed ids
    /// themselves are not included unless they depend on each other).
    pub fn blocked_by_failure(&self, failed_ids: &[String]) -> HashSet<String> {
        let mut blocked = HashSet::new();
        let mut queue: VecDeque<&str> = failed_ids.iter().map(|s| s.as_str()).collect();

        while let Some(id) = queue.pop_front() {
            for dependent in self.dependents_of(id) {
                if blocked.insert(dependent.clone()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        blocked
    }
}

/// Three-color DFS; every node on a gray back-edge loop is recorded
fn find_cyclic_ids(adjacency: &HashMap<String, Vec<String>>) -> HashSet<String> {
    let mut colors: HashMap<&str, Color> = adjacency.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut cyclic: HashSet<String> = HashSet::new();

    let mut ids: Vec<&str> = adjacency.keys().map(|k| k.as_str()).collect();
    ids.sort();

    for start in ids {
        if colors[start] != Color::White {
            continue;
        }
        dfs(start, adjacency, &mut colors, &mut Vec::new(), &mut cyclic);
    }
    cyclic
}

fn dfs<'a>(
    node: &'a str,
    adjacency: &'a HashMap<String, Vec<String>>,
    colors: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
    cyclic: &mut HashSet<String>,
) {
    colors.insert(node, Color::Gray);
    stack.push(node);

    if let Some(deps) = adjacency.get(node) {
        for dep in deps {
            match colors.get(dep.as_str()) {
                Some(Color::White) => dfs(dep.as_str(), adjacency, colors, stack, cyclic),
                Some(Color::Gray) => {
                    // Back edge: everything from dep to the stack top is on the cycle
                    let from = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    for member in &stack[from..] {
                        cyclic.insert(member.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    stack.pop();
    colors.insert(node, Color::Black);
}

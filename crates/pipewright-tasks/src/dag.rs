//! Task DAG construction and ordering

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{info, instrument};

use crate::task::Task;

/// A node in the task execution DAG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    /// Task name
    pub name: String,
    /// Position in registration order
    pub index: usize,
    /// Tasks that must complete before this one
    pub dependencies: Vec<String>,
    /// Tasks waiting on this one, in registration order
    pub dependents: Vec<String>,
    /// Execution wave (tasks in the same wave can run in parallel)
    pub wave: usize,
}

/// Directed acyclic graph of a pipeline's tasks
#[derive(Debug, Clone)]
pub struct TaskDag {
    /// All nodes in the DAG
    nodes: HashMap<String, TaskNode>,
    /// Tasks grouped by execution wave (wave 0 runs first, then wave 1, etc.)
    waves: Vec<Vec<String>>,
    /// Topologically sorted task order
    sorted_order: Vec<String>,
}

impl TaskDag {
    /// Build the DAG for `tasks`, given in registration order.
    ///
    /// Among tasks with no ordering constraint between them, the one
    /// registered first comes first, so the order is reproducible.
    #[instrument(skip_all, fields(task_count = tasks.len()))]
    pub fn build(tasks: &[Task]) -> Result<Self, DagError> {
        let mut nodes: HashMap<String, TaskNode> = HashMap::with_capacity(tasks.len());
        let mut names: Vec<&str> = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.iter().enumerate() {
            let node = TaskNode {
                name: task.name().to_string(),
                index,
                dependencies: task.dependencies().to_vec(),
                dependents: Vec::new(),
                wave: 0,
            };
            if nodes.insert(node.name.clone(), node).is_some() {
                return Err(DagError::DuplicateTask(task.name().to_string()));
            }
            names.push(task.name());
        }

        // Every dependency must resolve before any ordering is attempted
        for task in tasks {
            for dep in task.dependencies() {
                if !nodes.contains_key(dep) {
                    return Err(DagError::UnresolvedDependency {
                        task: task.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Build reverse dependency map (dependents)
        for task in tasks {
            for dep in task.dependencies() {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.push(task.name().to_string());
                }
            }
        }

        let sorted_order = Self::topological_sort(&nodes, &names)?;
        let waves = Self::compute_waves(&nodes, &sorted_order);

        for (wave_idx, wave_tasks) in waves.iter().enumerate() {
            for name in wave_tasks {
                if let Some(node) = nodes.get_mut(name) {
                    node.wave = wave_idx;
                }
            }
        }

        info!(
            task_count = nodes.len(),
            wave_count = waves.len(),
            "task DAG built"
        );

        Ok(Self {
            nodes,
            waves,
            sorted_order,
        })
    }

    /// Kahn's algorithm, releasing ready tasks by registration index
    fn topological_sort(
        nodes: &HashMap<String, TaskNode>,
        names: &[&str],
    ) -> Result<Vec<String>, DagError> {
        let mut in_degree: Vec<usize> = names
            .iter()
            .map(|name| nodes[*name].dependencies.len())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();
        let mut sorted: Vec<String> = Vec::with_capacity(names.len());

        while let Some(Reverse(index)) = ready.pop() {
            let node = &nodes[names[index]];
            sorted.push(node.name.clone());

            for dependent in &node.dependents {
                let dep_index = nodes[dependent].index;
                in_degree[dep_index] = in_degree[dep_index].saturating_sub(1);
                if in_degree[dep_index] == 0 {
                    ready.push(Reverse(dep_index));
                }
            }
        }

        if sorted.len() != names.len() {
            let in_sorted: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            let remaining: Vec<&str> = names
                .iter()
                .copied()
                .filter(|name| !in_sorted.contains(name))
                .collect();
            return Err(DagError::Cycle {
                cycle: Self::find_cycle(nodes, &remaining),
            });
        }

        Ok(sorted)
    }

    /// Walk unsatisfied dependency edges from the first stuck task until a
    /// task repeats; the walk from that task onward is a cycle.
    fn find_cycle(nodes: &HashMap<String, TaskNode>, remaining: &[&str]) -> Vec<String> {
        let stuck: HashSet<&str> = remaining.iter().copied().collect();
        let mut path: Vec<&str> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        let mut current = remaining[0];

        loop {
            if let Some(&start) = position.get(current) {
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);

            // Every stuck task has at least one stuck dependency
            match nodes[current]
                .dependencies
                .iter()
                .find(|dep| stuck.contains(dep.as_str()))
            {
                Some(next) => current = next.as_str(),
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    /// Compute execution waves (groups of tasks that can run in parallel)
    fn compute_waves(nodes: &HashMap<String, TaskNode>, sorted: &[String]) -> Vec<Vec<String>> {
        let mut wave_map: HashMap<&str, usize> = HashMap::new();

        for name in sorted {
            if let Some(node) = nodes.get(name) {
                let wave = node
                    .dependencies
                    .iter()
                    .filter_map(|dep| wave_map.get(dep.as_str()))
                    .max()
                    .map(|w| w + 1)
                    .unwrap_or(0);
                wave_map.insert(name.as_str(), wave);
            }
        }

        let wave_count = wave_map.values().max().map_or(0, |max| max + 1);
        let mut waves: Vec<Vec<String>> = vec![Vec::new(); wave_count];

        for name in sorted {
            if let Some(&wave) = wave_map.get(name.as_str()) {
                waves[wave].push(name.clone());
            }
        }

        waves
    }

    /// Get all task nodes
    pub fn nodes(&self) -> &HashMap<String, TaskNode> {
        &self.nodes
    }

    /// Get a specific task node
    pub fn get(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.get(name)
    }

    /// Get execution waves
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the DAG is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get topologically sorted order
    pub fn sorted(&self) -> &[String] {
        &self.sorted_order
    }
}

/// Errors during DAG construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// Dependency cycle detected
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    /// A declared dependency names no registered task
    #[error("Task '{task}' depends on '{dependency}', which is not registered")]
    UnresolvedDependency { task: String, dependency: String },

    /// Two tasks share a name
    #[error("Task '{0}' is registered more than once")]
    DuplicateTask(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, deps: &[&str]) -> Task {
        deps.iter()
            .fold(Task::new(name), |task, dep| task.depends_on(*dep))
    }

    fn position(dag: &TaskDag, name: &str) -> usize {
        dag.sorted().iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_build_dag() {
        let dag = TaskDag::build(&[task("zero", &[]), task("one", &["zero"])]).unwrap();

        assert_eq!(dag.len(), 2);
        assert_eq!(dag.sorted(), ["zero".to_string(), "one".to_string()]);
        assert_eq!(dag.get("zero").unwrap().dependents, vec!["one".to_string()]);
    }

    #[test]
    fn test_registration_order_is_independent_of_dependency_order() {
        let dag = TaskDag::build(&[task("one", &["zero"]), task("zero", &[])]).unwrap();
        assert_eq!(dag.sorted(), ["zero".to_string(), "one".to_string()]);
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let tasks = [
            task("c", &[]),
            task("a", &[]),
            task("sum", &["a", "b", "c"]),
            task("b", &[]),
        ];
        let dag = TaskDag::build(&tasks).unwrap();
        let order: Vec<&str> = dag.sorted().iter().map(String::as_str).collect();
        assert_eq!(order, vec!["c", "a", "b", "sum"]);
    }

    #[test]
    fn test_every_task_after_its_dependencies() {
        let tasks = [
            task("report", &["join", "clean"]),
            task("join", &["left", "right"]),
            task("clean", &["right"]),
            task("right", &["fetch"]),
            task("left", &["fetch"]),
            task("fetch", &[]),
        ];
        let dag = TaskDag::build(&tasks).unwrap();

        for t in &tasks {
            for dep in t.dependencies() {
                assert!(position(&dag, dep) < position(&dag, t.name()));
            }
        }
    }

    #[test]
    fn test_dag_waves() {
        let tasks = [
            task("core", &[]),
            task("utils", &["core"]),
            task("app", &["core", "utils"]),
            task("lint", &[]),
        ];
        let dag = TaskDag::build(&tasks).unwrap();

        assert_eq!(dag.get("core").unwrap().wave, 0);
        assert_eq!(dag.get("lint").unwrap().wave, 0);
        assert_eq!(dag.get("utils").unwrap().wave, 1);
        assert_eq!(dag.get("app").unwrap().wave, 2);
        assert_eq!(dag.waves().len(), 3);
    }

    #[test]
    fn test_cycle_named() {
        let tasks = [
            task("free", &[]),
            task("a", &["c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ];
        let err = TaskDag::build(&tasks).unwrap_err();
        match err {
            DagError::Cycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|n| n == name));
                }
                assert!(!cycle.iter().any(|n| n == "free"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = TaskDag::build(&[task("loop", &["loop"])]).unwrap_err();
        assert_eq!(
            err,
            DagError::Cycle {
                cycle: vec!["loop".to_string(), "loop".to_string()]
            }
        );
        assert_eq!(err.to_string(), "Dependency cycle detected: loop -> loop");
    }

    #[test]
    fn test_cycle_behind_dependency_chain() {
        let tasks = [task("tail", &["x"]), task("x", &["y"]), task("y", &["x"])];
        let err = TaskDag::build(&tasks).unwrap_err();
        match err {
            DagError::Cycle { cycle } => {
                assert_eq!(cycle, vec!["x".to_string(), "y".to_string(), "x".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_dependency() {
        let err = TaskDag::build(&[task("one", &["Missing"])]).unwrap_err();
        assert_eq!(
            err,
            DagError::UnresolvedDependency {
                task: "one".to_string(),
                dependency: "Missing".to_string()
            }
        );
        assert!(err.to_string().contains("'Missing'"));
    }

    #[test]
    fn test_duplicate_task() {
        let err = TaskDag::build(&[task("a", &[]), task("a", &[])]).unwrap_err();
        assert_eq!(err, DagError::DuplicateTask("a".to_string()));
    }

    #[test]
    fn test_empty() {
        let dag = TaskDag::build(&[]).unwrap();
        assert!(dag.is_empty());
        assert!(dag.waves().is_empty());
    }
}

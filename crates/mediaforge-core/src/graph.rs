//! Step graph — the dependency DAG shared by the validator and the executor.
//!
//! Edges come from three places:
//! - explicit `dependencies` entries,
//! - `$step.<id>.*` tokens anywhere in a step's inputs,
//! - `$prev.*` tokens, which depend on the preceding step in declared order.
//!
//! Both the validator and the executor build their view of a recipe through
//! [`StepGraph::build`], so they always agree on what an edge is.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde_json::Value;

use crate::error::GraphError;
use crate::recipe::Recipe;
use crate::reference::{references_in, Reference};

/// A dependency on a step id that does not exist in the recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingDependency {
    /// The step declaring the dependency.
    pub step_id: String,
    /// The id that could not be found.
    pub missing: String,
    /// Whether it came from `dependencies` (true) or from a `$step` token.
    pub explicit: bool,
}

/// Dependency graph over the steps of a recipe.
#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]`: steps that must succeed before step `i`.
    deps: Vec<BTreeSet<usize>>,
    /// `dependents[i]`: steps waiting on step `i`.
    dependents: Vec<BTreeSet<usize>>,
    dangling: Vec<DanglingDependency>,
}

impl StepGraph {
    /// Build the graph for a recipe.
    pub fn build(recipe: &Recipe) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(recipe.steps.len());
        for (i, step) in recipe.steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }

        let n = recipe.steps.len();
        let mut graph = Self {
            ids: recipe.steps.iter().map(|s| s.id.clone()).collect(),
            index,
            deps: vec![BTreeSet::new(); n],
            dependents: vec![BTreeSet::new(); n],
            dangling: Vec::new(),
        };

        for (i, step) in recipe.steps.iter().enumerate() {
            for dep in &step.dependencies {
                graph.link(i, dep, true);
            }

            let inputs = Value::Object(step.inputs.clone().into_iter().collect());
            for reference in references_in(&inputs) {
                match reference {
                    Reference::Step { step_id, .. } => graph.link(i, &step_id, false),
                    Reference::Prev { .. } if i > 0 => {
                        graph.deps[i].insert(i - 1);
                        graph.dependents[i - 1].insert(i);
                    }
                    _ => {}
                }
            }
        }

        Ok(graph)
    }

    fn link(&mut self, step: usize, dep_id: &str, explicit: bool) {
        match self.index.get(dep_id) {
            Some(&dep) => {
                self.deps[step].insert(dep);
                self.dependents[dep].insert(step);
            }
            None => {
                let dangling = DanglingDependency {
                    step_id: self.ids[step].clone(),
                    missing: dep_id.to_string(),
                    explicit,
                };
                if !self.dangling.contains(&dangling) {
                    self.dangling.push(dangling);
                }
            }
        }
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Step ids in declared order.
    pub fn step_ids(&self) -> &[String] {
        &self.ids
    }

    /// Whether a step with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Dependencies that name unknown steps.
    pub fn dangling(&self) -> &[DanglingDependency] {
        &self.dangling
    }

    /// Direct dependencies of a step, in declared order.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.deps)
    }

    /// Steps that depend directly on `id`, in declared order.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.dependents)
    }

    fn neighbours<'a>(&'a self, id: &str, edges: &'a [BTreeSet<usize>]) -> Vec<&'a str> {
        self.index
            .get(id)
            .map(|&i| edges[i].iter().map(|&j| self.ids[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Every step `id` depends on, directly or transitively.
    pub fn ancestors(&self, id: &str) -> Vec<&str> {
        self.closure(id, &self.deps)
    }

    /// Every step depending on `id`, directly or transitively.
    pub fn descendants(&self, id: &str) -> Vec<&str> {
        self.closure(id, &self.dependents)
    }

    fn closure<'a>(&'a self, id: &str, edges: &[BTreeSet<usize>]) -> Vec<&'a str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = edges[start].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(edges[next].iter().copied());
            }
        }
        seen.into_iter().map(|i| self.ids[i].as_str()).collect()
    }

    /// Find a cycle, returned as a path whose first and last ids match.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            node: usize,
            graph: &StepGraph,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::OnStack;
            stack.push(node);
            for &dep in &graph.deps[node] {
                match marks[dep] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|&n| graph.ids[n].clone()).collect();
                        cycle.push(graph.ids[dep].clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(dep, graph, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut stack = Vec::new();
        for node in 0..self.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = visit(node, self, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Group steps into execution waves: every step lands in the first wave
    /// after all of its dependencies. Steps keep declared order within a wave.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut remaining: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut current: Vec<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut placed = 0;
        let mut waves = Vec::new();

        while !current.is_empty() {
            placed += current.len();
            let mut next = BTreeSet::new();
            for &node in &current {
                for &dependent in &self.dependents[node] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.insert(dependent);
                    }
                }
            }
            waves.push(current.iter().map(|&i| self.ids[i].clone()).collect());
            current = next.into_iter().collect();
        }

        if placed < self.len() {
            return Err(GraphError::Cycle(self.find_cycle().unwrap_or_default()));
        }
        Ok(waves)
    }
}

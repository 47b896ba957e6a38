//! Dependency graph construction: run this before checking or building a plan.
//!
//! Rules enforced:
//! 1. Target and import names must be valid and unique.
//! 2. Every `{{name}}` and explicit dependency must name a target or import.
//! 3. An output file can only be produced by one target.
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! A target that reads (`file_in`) a file another target writes (`file_out`)
//! depends on the producing target.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::analyze::analyze_command;
use crate::{models::Plan, EngineError};

/// Everything one target depends on, resolved against the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetDeps {
    /// Upstream targets (via `{{name}}`, explicit deps or produced files).
    pub targets: BTreeSet<String>,
    pub imports: BTreeSet<String>,
    pub files_in: BTreeSet<String>,
    pub files_out: BTreeSet<String>,
}

/// The validated dependency graph of a plan.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    deps: HashMap<String, TargetDeps>,
    dependents: HashMap<String, Vec<String>>,
    producers: BTreeMap<String, String>,
}

impl DependencyGraph {
    /// Analyze every command of `plan` and assemble the graph.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateName`] / [`EngineError::InvalidName`] /
    ///   [`EngineError::InvalidImport`] from name validation.
    /// - [`EngineError::MalformedCommand`] if a command cannot be scanned.
    /// - [`EngineError::UnknownReference`] if a reference is dangling.
    /// - [`EngineError::ConflictingFileOut`] if two targets write one file.
    /// - [`EngineError::CycleDetected`] if the graph is not acyclic.
    pub fn build(plan: &Plan) -> Result<Self, EngineError> {
        plan.validate_names()?;

        let target_names: HashSet<&str> = plan.targets.iter().map(|t| t.name.as_str()).collect();
        let import_names: HashSet<&str> = plan.imports.iter().map(|i| i.name.as_str()).collect();

        // -------------------------------------------------------------------
        // 1. Analyze commands and resolve references
        // -------------------------------------------------------------------
        let mut deps: HashMap<String, TargetDeps> = HashMap::with_capacity(plan.targets.len());
        let mut producers: BTreeMap<String, String> = BTreeMap::new();

        for target in &plan.targets {
            let analyzed = analyze_command(&target.command).map_err(|e| {
                EngineError::MalformedCommand {
                    target: target.name.clone(),
                    message: e.to_string(),
                }
            })?;

            let mut resolved = TargetDeps {
                files_in: analyzed.files_in,
                files_out: analyzed.files_out,
                ..TargetDeps::default()
            };

            for name in analyzed.symbols.iter().chain(target.deps.iter()) {
                if target_names.contains(name.as_str()) {
                    resolved.targets.insert(name.clone());
                } else if import_names.contains(name.as_str()) {
                    resolved.imports.insert(name.clone());
                } else {
                    return Err(EngineError::UnknownReference {
                        target: target.name.clone(),
                        name: name.clone(),
                    });
                }
            }

            for path in &resolved.files_out {
                if let Some(first) = producers.get(path) {
                    return Err(EngineError::ConflictingFileOut {
                        path: path.clone(),
                        first: first.clone(),
                        second: target.name.clone(),
                    });
                }
                producers.insert(path.clone(), target.name.clone());
            }

            deps.insert(target.name.clone(), resolved);
        }

        // File-mediated edges. Rewriting one's own output is not a dependency.
        for (name, entry) in deps.iter_mut() {
            let upstream: Vec<String> = entry
                .files_in
                .iter()
                .filter_map(|f| producers.get(f))
                .filter(|producer| *producer != name)
                .cloned()
                .collect();
            entry.targets.extend(upstream);
        }

        // -------------------------------------------------------------------
        // 2. Topological sort (Kahn's algorithm, ties broken by plan order)
        // -------------------------------------------------------------------
        let index: HashMap<&str, usize> = plan
            .targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> = plan
            .targets
            .iter()
            .map(|t| (t.name.clone(), Vec::new()))
            .collect();
        let mut in_degree: Vec<usize> = vec![0; plan.targets.len()];

        for target in &plan.targets {
            for upstream in &deps[&target.name].targets {
                if let Some(list) = dependents.get_mut(upstream) {
                    list.push(target.name.clone());
                }
                in_degree[index[target.name.as_str()]] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order: Vec<String> = Vec::with_capacity(plan.targets.len());

        while let Some(i) = ready.pop_first() {
            let name = &plan.targets[i].name;
            order.push(name.clone());
            for dependent in &dependents[name] {
                let j = index[dependent.as_str()];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        // If we didn't visit every target the graph contains a cycle.
        if order.len() != plan.targets.len() {
            let blocked = plan
                .targets
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, t)| t.name.clone())
                .collect();
            return Err(EngineError::CycleDetected(blocked));
        }

        Ok(Self {
            order,
            deps,
            dependents,
            producers,
        })
    }

    /// Targets in a valid build order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    pub fn deps(&self, name: &str) -> Option<&TargetDeps> {
        self.deps.get(name)
    }

    /// Targets that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Targets without upstream targets.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| self.deps[n.as_str()].targets.is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Files read by some target and produced by none, sorted.
    pub fn leaf_files(&self) -> BTreeSet<&str> {
        self.deps
            .values()
            .flat_map(|d| d.files_in.iter())
            .filter(|f| !self.producers.contains_key(*f))
            .map(String::as_str)
            .collect()
    }

    /// The target producing `path`, if any.
    pub fn producer(&self, path: &str) -> Option<&str> {
        self.producers.get(path).map(String::as_str)
    }

    /// Every target `name` transitively depends on, in build order.
    pub fn upstream(&self, name: &str) -> Vec<&str> {
        let reached = self.walk(name, |n| {
            self.deps
                .get(n)
                .map(|d| d.targets.iter().cloned().collect())
                .unwrap_or_default()
        });
        self.in_order(&reached)
    }

    /// Every target that transitively depends on `name`, in build order.
    pub fn downstream(&self, name: &str) -> Vec<&str> {
        let reached = self.walk(name, |n| self.dependents(n).to_vec());
        self.in_order(&reached)
    }

    /// `names` plus all of their upstream targets.
    ///
    /// # Errors
    /// [`EngineError::UnknownTarget`] if a name is not a target.
    pub fn with_upstream(&self, names: &[String]) -> Result<HashSet<String>, EngineError> {
        let mut selected = HashSet::new();
        for name in names {
            if !self.contains(name) {
                return Err(EngineError::UnknownTarget(name.clone()));
            }
            selected.insert(name.clone());
            selected.extend(self.upstream(name).into_iter().map(str::to_owned));
        }
        Ok(selected)
    }

    fn walk<F>(&self, start: &str, next: F) -> HashSet<String>
    where
        F: Fn(&str) -> Vec<String>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = next(start).into();
        while let Some(n) = queue.pop_front() {
            if seen.insert(n.clone()) {
                queue.extend(next(&n));
            }
        }
        seen
    }

    fn in_order(&self, set: &HashSet<String>) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| set.contains(n.as_str()))
            .map(String::as_str)
            .collect()
    }
}

//! Module dependency graph.
//!
//! A static mapping of module name to its direct dependencies, used to compute
//! an order in which every module comes after all of its transitive
//! dependencies.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ShellConfig;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Declared modules, in declaration order
    modules: Vec<(String, Vec<String>)>,
    index: HashMap<String, usize>,
}

enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new<I, N, D>(modules: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut graph = Self::default();
        for (name, dependencies) in modules {
            let name = name.into();
            if graph.index.contains_key(&name) {
                warn!("Module {} declared more than once; keeping the first", name);
                continue;
            }
            graph.index.insert(name.clone(), graph.modules.len());
            graph
                .modules
                .push((name, dependencies.into_iter().map(Into::into).collect()));
        }
        graph
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(
            config
                .modules
                .iter()
                .map(|m| (m.name.clone(), m.dependencies.clone())),
        )
    }

    /// Direct dependencies of `name`; empty for unknown modules.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.index
            .get(name)
            .map(|&i| self.modules[i].1.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declared module names, in declaration order.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Depth-first post-order over the declared modules.
    ///
    /// Each module is visited in declaration order; its dependencies are
    /// emitted before it, and nothing is emitted twice. Dependencies that are
    /// not declared themselves are treated as leaves and still appear.
    ///
    /// # Errors
    ///
    /// `GraphError::Cycle` when a module depends on itself, directly or
    /// transitively. The error carries the offending path.
    pub fn compute_load_order(&self) -> GraphResult<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.modules.len());

        for root in self.modules() {
            if marks.contains_key(root) {
                continue;
            }
            marks.insert(root, Mark::InProgress);
            // (module, index of the next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

            while let Some(frame) = stack.last_mut() {
                let (name, next) = *frame;
                frame.1 += 1;

                match self.dependencies_of(name).get(next) {
                    Some(dependency) => match marks.get(dependency.as_str()) {
                        Some(Mark::Done) => {}
                        Some(Mark::InProgress) => {
                            let start = stack
                                .iter()
                                .position(|(n, _)| *n == dependency.as_str())
                                .unwrap_or(0);
                            let mut path: Vec<String> =
                                stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                            path.push(dependency.clone());
                            return Err(GraphError::Cycle { path });
                        }
                        None => {
                            marks.insert(dependency.as_str(), Mark::InProgress);
                            stack.push((dependency.as_str(), 0));
                        }
                    },
                    None => {
                        marks.insert(name, Mark::Done);
                        order.push(name.to_string());
                        stack.pop();
                    }
                }
            }
        }

        debug!("Load order: {}", order.join(" → "));
        Ok(order)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Circular dependency detected: {}", path.join(" → "))]
    Cycle { path: Vec<String> },
}

pub type GraphResult<T> = Result<T, GraphError>;

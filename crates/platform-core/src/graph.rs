//! Repository dependency graph and build ordering.
//!
//! An edge `B -> A` means "B depends on A": A must be built before B.
//! Ordering is a depth-first post-order walk that starts from repositories in
//! declaration order and visits `depends_on` in declaration order, so the
//! result is deterministic and, for every configuration where direct
//! dependencies were already listed before their dependents, identical to the
//! declaration order.

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::model::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Borrowed view over a set of repositories.
#[derive(Debug, Clone)]
pub struct DependencyGraph<'a> {
    repositories: Vec<&'a Repository>,
    nodes: HashMap<&'a str, &'a Repository>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new<I>(repositories: I) -> Self
    where
        I: IntoIterator<Item = &'a Repository>,
    {
        let repositories: Vec<&'a Repository> = repositories.into_iter().collect();
        let nodes = repositories.iter().map(|r| (r.id.as_str(), *r)).collect();
        Self {
            repositories,
            nodes,
        }
    }

    /// Fails on unknown dependencies and on cycles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_order().map(|_| ())
    }

    /// Every repository, dependencies before dependents.
    pub fn build_order(&self) -> Result<Vec<&'a Repository>, ConfigError> {
        let mut marks = HashMap::new();
        let mut order = Vec::with_capacity(self.repositories.len());
        for repository in &self.repositories {
            self.visit(repository, &mut marks, &mut Vec::new(), &mut order)?;
        }
        Ok(order)
    }

    /// `repository` and its transitive dependencies, dependencies first.
    pub fn closure_order(&self, repository: &str) -> Result<Vec<&'a Repository>, ConfigError> {
        let root = self
            .nodes
            .get(repository)
            .ok_or_else(|| ConfigError::UnknownDependency {
                repository: repository.to_string(),
                dependency: repository.to_string(),
            })?;
        let mut order = Vec::new();
        self.visit(root, &mut HashMap::new(), &mut Vec::new(), &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        repository: &'a Repository,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<&'a Repository>,
    ) -> Result<(), ConfigError> {
        match marks.get(repository.id.as_str()) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path
                    .iter()
                    .position(|id| *id == repository.id)
                    .unwrap_or(0);
                let mut repos: Vec<String> =
                    path[start..].iter().map(|id| id.to_string()).collect();
                repos.push(repository.id.clone());
                return Err(ConfigError::DependencyCycle { repos });
            }
            None => {}
        }

        marks.insert(repository.id.as_str(), Mark::Visiting);
        path.push(repository.id.as_str());
        for dependency in &repository.depends_on {
            let node = self.nodes.get(dependency.as_str()).ok_or_else(|| {
                ConfigError::UnknownDependency {
                    repository: repository.id.clone(),
                    dependency: dependency.clone(),
                }
            })?;
            self.visit(node, marks, path, order)?;
        }
        path.pop();
        marks.insert(repository.id.as_str(), Mark::Done);
        order.push(repository);
        Ok(())
    }
}

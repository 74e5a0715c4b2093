//! The resource graph: named nodes with parent edges and a busy flag.
//!
//! This is the engine's only concurrency-control primitive. Admission control
//! asks [`ResourceGraph::can_acquire`] for a task's declared resource names
//! and, on success, marks exactly those nodes busy. Hierarchy makes the
//! exclusion coarse: a node can be acquired only while its whole ancestor
//! chain and everything beneath it are free, so holding `system` excludes
//! every node in the graph and holding `disk:ada0` excludes `system` without
//! affecting `disk:ada1`.
//!
//! The graph is not internally synchronized. The distribution loop owns it
//! exclusively, which makes the check-then-acquire pair atomic with respect
//! to releases arriving from completed tasks.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors produced by resource graph operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// A node with this name is already registered.
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    /// No node with this name is registered.
    #[error("unknown resource: {0}")]
    NotFound(String),
    /// A declared parent is not registered.
    #[error("resource '{name}' references unknown parent '{parent}'")]
    ParentNotFound {
        /// The node being registered.
        name: String,
        /// The missing parent name.
        parent: String,
    },
    /// Acquisition attempted while a node in the exclusion set is held.
    #[error("resource busy: {0}")]
    Busy(String),
}

#[derive(Debug, Default)]
struct Node {
    parents: Vec<String>,
    children: Vec<String>,
    busy: bool,
}

/// A forest of named resource nodes with hierarchical mutual exclusion.
#[derive(Debug, Default)]
pub struct ResourceGraph {
    nodes: HashMap<String, Node>,
}

impl ResourceGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under `name` depending from `parents`.
    ///
    /// Parents must already be registered, so edges always point at existing
    /// nodes and the graph stays acyclic by construction.
    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        parents: Vec<String>,
    ) -> Result<(), ResourceError> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(ResourceError::AlreadyExists(name));
        }
        for parent in &parents {
            if !self.nodes.contains_key(parent) {
                return Err(ResourceError::ParentNotFound {
                    name,
                    parent: parent.clone(),
                });
            }
        }
        for parent in &parents {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.push(name.clone());
            }
        }
        debug!(resource = %name, parents = ?parents, "resource registered");
        self.nodes.insert(
            name,
            Node {
                parents,
                children: Vec::new(),
                busy: false,
            },
        );
        Ok(())
    }

    /// Remove the node under `name`.
    ///
    /// Children keep their remaining parents; a busy node is removed anyway
    /// (the underlying entity is gone) and the eventual release of its name
    /// is ignored.
    pub fn remove_resource(&mut self, name: &str) -> Result<(), ResourceError> {
        let node = self
            .nodes
            .remove(name)
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))?;
        if node.busy {
            warn!(resource = %name, "removing a resource that is currently held");
        }
        for parent in &node.parents {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|c| c != name);
            }
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parents.retain(|p| p != name);
            }
        }
        debug!(resource = %name, "resource removed");
        Ok(())
    }

    /// Whether a node under `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names currently marked busy, in no particular order.
    #[must_use]
    pub fn busy_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.busy)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether every named node can be acquired right now.
    ///
    /// True iff every named node, every transitive ancestor of a named node,
    /// and every transitive descendant of a named node is not busy. Unknown
    /// names are an error, not a permanent "no".
    pub fn can_acquire<S: AsRef<str>>(&self, names: &[S]) -> Result<bool, ResourceError> {
        Ok(self.first_blocked(names)?.is_none())
    }

    /// Mark exactly the named nodes busy.
    ///
    /// Re-checks the exclusion set and refuses with [`ResourceError::Busy`]
    /// naming the blocking node if the check fails.
    pub fn acquire<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ResourceError> {
        if let Some(blocked) = self.first_blocked(names)? {
            return Err(ResourceError::Busy(blocked));
        }
        for name in names {
            if let Some(node) = self.nodes.get_mut(name.as_ref()) {
                node.busy = true;
            }
        }
        debug!(resources = ?names.iter().map(AsRef::as_ref).collect::<Vec<_>>(), "resources acquired");
        Ok(())
    }

    /// Clear the busy flag on the named nodes.
    ///
    /// Idempotent; names no longer registered are skipped. Callers re-run
    /// admission control afterwards since a release may unblock waiting
    /// tasks.
    pub fn release<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            match self.nodes.get_mut(name.as_ref()) {
                Some(node) => node.busy = false,
                None => debug!(resource = %name.as_ref(), "released name is not registered, skipping"),
            }
        }
        debug!(resources = ?names.iter().map(AsRef::as_ref).collect::<Vec<_>>(), "resources released");
    }

    /// First busy node in the exclusion set of `names`, if any.
    ///
    /// The exclusion set is the named nodes plus their transitive ancestors
    /// and transitive descendants.
    fn first_blocked<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<String>, ResourceError> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut frontier: VecDeque<(&str, Direction)> = VecDeque::new();

        for name in names {
            let name = name.as_ref();
            if !self.nodes.contains_key(name) {
                return Err(ResourceError::NotFound(name.to_string()));
            }
            if visited.insert(name) {
                frontier.push_back((name, Direction::Both));
            }
        }

        while let Some((name, direction)) = frontier.pop_front() {
            let Some(node) = self.nodes.get(name) else {
                continue;
            };
            if node.busy {
                return Ok(Some(name.to_string()));
            }
            if direction.upward() {
                for parent in &node.parents {
                    if visited.insert(parent) {
                        frontier.push_back((parent, Direction::Up));
                    }
                }
            }
            if direction.downward() {
                for child in &node.children {
                    if visited.insert(child) {
                        frontier.push_back((child, Direction::Down));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Traversal direction while walking the exclusion set. Named nodes expand
/// both ways; ancestors only keep climbing, descendants only keep descending.
#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
    Both,
}

impl Direction {
    const fn upward(self) -> bool {
        matches!(self, Self::Up | Self::Both)
    }

    const fn downward(self) -> bool {
        matches!(self, Self::Down | Self::Both)
    }
}

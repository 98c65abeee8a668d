//! Execution path tracking
//!
//! A run's execution is a tree of paths: the root path covers the sequential
//! spine, and each parallel region spawns one child path per branch. The tree
//! is stored as an arena (`path_id -> PathNode`) with parent/child links by
//! id, so cloning a [`PathTree`] is a plain value copy with no pointer
//! chasing and no back-reference cycles.
//!
//! Invariants enforced here:
//!
//! - a path can only be marked MERGED once every child is terminal
//! - a parent cannot COMPLETE while any child is non-terminal
//! - completed step ids are recorded in order, once per completion

use super::status::PathStatus;
use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One node in the execution-path tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathNode {
    /// Unique id within the run, e.g. `"root"` or `"root/par-1/B"`
    pub path_id: String,

    /// Current path status
    pub status: PathStatus,

    /// Step ids completed on this path, in completion order
    pub completed_steps: Vec<String>,

    /// Parent path id; `None` for the root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Child path ids, in spawn order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// Arena-indexed tree of execution paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathTree {
    nodes: HashMap<String, PathNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<String>,
}

impl PathTree {
    /// Empty tree; call [`PathTree::start_root`] before recording anything
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root path and mark it RUNNING
    pub fn start_root(&mut self, path_id: impl Into<String>) -> Result<()> {
        let path_id = path_id.into();
        if self.root.is_some() {
            return Err(StateError::Path("root path already exists".to_string()));
        }
        self.nodes.insert(
            path_id.clone(),
            PathNode {
                path_id: path_id.clone(),
                status: PathStatus::Running,
                completed_steps: Vec::new(),
                parent: None,
                children: Vec::new(),
            },
        );
        self.root = Some(path_id);
        Ok(())
    }

    /// Spawn a child path under `parent` for a parallel branch
    pub fn spawn_child(&mut self, parent: &str, path_id: impl Into<String>) -> Result<()> {
        let path_id = path_id.into();
        if self.nodes.contains_key(&path_id) {
            return Err(StateError::Path(format!("path '{}' already exists", path_id)));
        }
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StateError::Path(format!("unknown parent path '{}'", parent)))?;
        parent_node.children.push(path_id.clone());

        self.nodes.insert(
            path_id.clone(),
            PathNode {
                path_id,
                status: PathStatus::Started,
                completed_steps: Vec::new(),
                parent: Some(parent.to_string()),
                children: Vec::new(),
            },
        );
        Ok(())
    }

    /// Root path id, if the tree has been started
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Look up a node by id
    pub fn node(&self, path_id: &str) -> Option<&PathNode> {
        self.nodes.get(path_id)
    }

    /// Number of paths in the tree
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record a completed step on a path and mark the path RUNNING
    pub fn record_step(&mut self, path_id: &str, step_id: impl Into<String>) -> Result<()> {
        let node = self.node_mut(path_id)?;
        if node.status.is_terminal() {
            return Err(StateError::Path(format!(
                "cannot record step on terminal path '{}'",
                path_id
            )));
        }
        node.status = PathStatus::Running;
        node.completed_steps.push(step_id.into());
        Ok(())
    }

    /// Set a non-terminal control status (RUNNING or PAUSED)
    pub fn set_status(&mut self, path_id: &str, status: PathStatus) -> Result<()> {
        if status.is_terminal() {
            return Err(StateError::Path(format!(
                "use complete/fail/merge to terminate path '{}'",
                path_id
            )));
        }
        self.node_mut(path_id)?.status = status;
        Ok(())
    }

    /// Mark a path COMPLETED; rejected while any child is non-terminal
    pub fn complete(&mut self, path_id: &str) -> Result<()> {
        self.ensure_children_terminal(path_id, "complete")?;
        self.node_mut(path_id)?.status = PathStatus::Completed;
        Ok(())
    }

    /// Mark a path FAILED
    pub fn fail(&mut self, path_id: &str) -> Result<()> {
        self.node_mut(path_id)?.status = PathStatus::Failed;
        Ok(())
    }

    /// Mark a path MERGED at a join; rejected while any child is non-terminal
    pub fn merge(&mut self, path_id: &str) -> Result<()> {
        self.ensure_children_terminal(path_id, "merge")?;
        self.node_mut(path_id)?.status = PathStatus::Merged;
        Ok(())
    }

    /// All step ids completed anywhere in the tree, root-first
    pub fn all_completed_steps(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            self.collect_steps(root, &mut out);
        }
        out
    }

    fn collect_steps(&self, path_id: &str, out: &mut Vec<String>) {
        if let Some(node) = self.nodes.get(path_id) {
            out.extend(node.completed_steps.iter().cloned());
            for child in &node.children {
                self.collect_steps(child, out);
            }
        }
    }

    fn ensure_children_terminal(&self, path_id: &str, action: &str) -> Result<()> {
        let node = self
            .nodes
            .get(path_id)
            .ok_or_else(|| StateError::Path(format!("unknown path '{}'", path_id)))?;
        for child in &node.children {
            if let Some(child_node) = self.nodes.get(child) {
                if !child_node.status.is_terminal() {
                    return Err(StateError::Path(format!(
                        "cannot {} path '{}': child '{}' is {}",
                        action, path_id, child, child_node.status
                    )));
                }
            }
        }
        Ok(())
    }

    fn node_mut(&mut self, path_id: &str) -> Result<&mut PathNode> {
        self.nodes
            .get_mut(path_id)
            .ok_or_else(|| StateError::Path(format!("unknown path '{}'", path_id)))
    }
}

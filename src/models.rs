//! Core models for the taskstack library
//!
//! This module contains the node and tree data types shared by the state machine,
//! the session store and the command facade.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Title used when a task is created or renamed with blank text
pub const UNTITLED_TASK: &str = "Untitled task";

/// Title given to the root of every fresh session
pub const ROOT_TITLE: &str = "Root";

/// Opaque node identifier
pub type NodeId = String;

/// Errors raised when a command references the tree incorrectly.
///
/// Both variants are rejections: the tree is left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Node '{0}' not found")]
    NodeNotFound(NodeId),
    #[error("Node '{0}' is the root and cannot be removed")]
    RootNodeProtected(NodeId),
}

/// Lifecycle of a node. Deleted nodes stay in the map but are invisible to traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Deleted,
}

/// Trims a title, substituting a placeholder when nothing is left
pub fn sanitize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        UNTITLED_TASK.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Generates a node id that is not already a key in `nodes`
pub(crate) fn generate_node_id(nodes: &BTreeMap<NodeId, Node>) -> NodeId {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = format!(
            "n-{}-{:06x}",
            Utc::now().timestamp_millis(),
            rng.gen::<u32>() & 0x00ff_ffff
        );
        if !nodes.contains_key(&candidate) {
            return candidate;
        }
    }
}

/// A single task in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub title: String,
    /// Insertion order is display order
    pub children_ids: Vec<NodeId>,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Creates an active node with a sanitized title and no children
    pub fn new(id: NodeId, parent_id: Option<NodeId>, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id,
            title: sanitize_title(title),
            children_ids: Vec::new(),
            status: NodeStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// A full point-in-time copy of the tree, used for undo and redo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub root_id: NodeId,
    pub focused_node_id: NodeId,
    pub nodes: BTreeMap<NodeId, Node>,
}

/// The complete state of one session, as held in memory and written to `active.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeState {
    pub session_id: String,
    pub root_id: NodeId,
    pub focused_node_id: NodeId,
    pub nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    pub undo_stack: Vec<Snapshot>,
    #[serde(default)]
    pub redo_stack: Vec<Snapshot>,
}

impl TreeState {
    /// Creates a root-only state for a brand new session
    pub fn fresh(session_id: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        let root_id = generate_node_id(&nodes);
        nodes.insert(root_id.clone(), Node::new(root_id.clone(), None, ROOT_TITLE));
        Self {
            session_id: session_id.into(),
            focused_node_id: root_id.clone(),
            root_id,
            nodes,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        }
    }

    /// Looks up a node regardless of status
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Looks up a node only if it is active
    pub fn active_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).filter(|node| node.is_active())
    }

    /// Returns the focused node; falls back to the root if focus is stale
    pub fn focused_node(&self) -> Option<&Node> {
        self.active_node(&self.focused_node_id)
            .or_else(|| self.nodes.get(&self.root_id))
    }

    /// Active children of `id`, in display order
    pub fn active_children(&self, id: &str) -> Vec<&Node> {
        self.nodes
            .get(id)
            .map(|node| {
                node.children_ids
                    .iter()
                    .filter_map(|child| self.active_node(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Walks the active tree depth-first in display order, yielding `(depth, node)`
    pub fn walk_active(&self) -> Vec<(usize, &Node)> {
        let mut out = Vec::new();
        let Some(root) = self.active_node(&self.root_id) else {
            return out;
        };
        let mut seen = HashSet::new();
        let mut stack = vec![(0usize, root)];
        while let Some((depth, node)) = stack.pop() {
            if !seen.insert(node.id.as_str()) {
                continue;
            }
            out.push((depth, node));
            // Reverse so the first child is popped first
            for child in self.active_children(&node.id).into_iter().rev() {
                stack.push((depth + 1, child));
            }
        }
        out
    }

    /// Captures the tree part of this state for the undo or redo stack
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            root_id: self.root_id.clone(),
            focused_node_id: self.focused_node_id.clone(),
            nodes: self.nodes.clone(),
        }
    }

    /// Replaces the tree part of this state with a snapshot, keeping session and stacks
    pub(crate) fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.root_id = snapshot.root_id;
        self.focused_node_id = snapshot.focused_node_id;
        self.nodes = snapshot.nodes;
    }

    /// Resets focus to the root if the focused node is missing or deleted
    pub(crate) fn ensure_focus(&mut self) {
        if self.active_node(&self.focused_node_id).is_none() {
            self.focused_node_id = self.root_id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("  Write report \n"), "Write report");
        assert_eq!(sanitize_title(""), UNTITLED_TASK);
        assert_eq!(sanitize_title(" \t "), UNTITLED_TASK);
    }

    #[test]
    fn test_node_new_stamps_times() {
        let node = Node::new("n-1".to_string(), None, "  ");
        assert_eq!(node.title, UNTITLED_TASK);
        assert_eq!(node.created_at, node.updated_at);
        assert!(node.is_active());
        assert!(node.deleted_at.is_none());
    }

    #[test]
    fn test_fresh_state_has_single_root() {
        let state = TreeState::fresh("2024-05-01_09-30-00");
        assert_eq!(state.nodes.len(), 1);
        let root = state.node(&state.root_id).unwrap();
        assert_eq!(root.parent_id, None);
        assert_eq!(root.title, ROOT_TITLE);
        assert_eq!(state.focused_node_id, state.root_id);
        assert!(state.undo_stack.is_empty());
        assert!(state.redo_stack.is_empty());
    }

    #[test]
    fn test_serialized_field_names() {
        let state = TreeState::fresh("s1");
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("focusedNodeId").is_some());
        assert!(json.get("undoStack").is_some());
        let root = &json["nodes"][&state.root_id];
        assert_eq!(root["status"], "active");
        assert!(root["parentId"].is_null());
        assert!(root.get("childrenIds").is_some());
        assert!(root.get("deletedAt").is_none());
    }

    #[test]
    fn test_missing_stacks_default_to_empty() {
        let state = TreeState::fresh("s1");
        let mut json = serde_json::to_value(&state).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("undoStack");
        obj.remove("redoStack");
        let parsed: TreeState = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_ensure_focus_falls_back_to_root() {
        let mut state = TreeState::fresh("s1");
        state.focused_node_id = "missing".to_string();
        state.ensure_focus();
        assert_eq!(state.focused_node_id, state.root_id);
    }

    #[test]
    fn test_walk_active_skips_deleted() {
        let mut state = TreeState::fresh("s1");
        let root_id = state.root_id.clone();
        let a = Node::new("a".to_string(), Some(root_id.clone()), "A");
        let mut b = Node::new("b".to_string(), Some(root_id.clone()), "B");
        b.status = NodeStatus::Deleted;
        let c = Node::new("c".to_string(), Some("a".to_string()), "C");
        state.nodes.insert("a".to_string(), a);
        state.nodes.insert("b".to_string(), b);
        state.nodes.insert("c".to_string(), c);
        state
            .nodes
            .get_mut(&root_id)
            .unwrap()
            .children_ids
            .extend(["a".to_string(), "b".to_string()]);
        state.nodes.get_mut("a").unwrap().children_ids.push("c".to_string());

        let walked: Vec<(usize, &str)> = state
            .walk_active()
            .into_iter()
            .map(|(depth, node)| (depth, node.id.as_str()))
            .collect();
        assert_eq!(walked, vec![(0, root_id.as_str()), (1, "a"), (2, "c")]);
    }

    #[test]
    fn test_walk_active_visits_each_node_once() {
        let mut state = TreeState::fresh("s");
        let root_id = state.root_id.clone();
        let root = state.nodes.get_mut(&root_id).unwrap();
        root.children_ids.push(root_id.clone());

        let walked = state.walk_active();
        assert_eq!(walked.len(), 1);
        assert_eq!(walked[0].1.id, root_id);
    }
}

//! Tree state machine
//!
//! Owns the in-memory [`TreeState`] of one session and applies every mutation to it,
//! keeping a bounded undo history of full snapshots.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::{
    generate_node_id, sanitize_title, Node, NodeId, NodeStatus, Snapshot, TreeError, TreeState,
};

/// Maximum number of undo snapshots kept per session
pub const UNDO_LIMIT: usize = 200;

/// Result of adding a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOutcome {
    pub new_node_id: NodeId,
    pub state: TreeState,
}

/// Result of completing or deleting a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub next_focus_id: NodeId,
    pub state: TreeState,
}

/// Mutation engine for a single session's tree
#[derive(Debug, Clone)]
pub struct TreeMachine {
    state: TreeState,
    undo_limit: usize,
}

impl TreeMachine {
    /// Creates a machine seeded from a (possibly freshly loaded) state
    pub fn new(state: TreeState) -> Self {
        Self::with_undo_limit(state, UNDO_LIMIT)
    }

    /// Creates a machine with a custom undo capacity
    pub fn with_undo_limit(mut state: TreeState, undo_limit: usize) -> Self {
        state.ensure_focus();
        let overflow = state.undo_stack.len().saturating_sub(undo_limit);
        state.undo_stack.drain(..overflow);
        Self { state, undo_limit }
    }

    /// Returns an independent copy of the current state
    pub fn get_state(&self) -> TreeState {
        self.state.clone()
    }

    /// Borrows the current state without copying it
    pub fn state(&self) -> &TreeState {
        &self.state
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Adds a new last child under `parent_id` and focuses it
    pub fn add_child(&mut self, parent_id: &str, title: &str) -> Result<AddOutcome, TreeError> {
        self.require_active(parent_id)?;
        self.push_undo();

        let new_id = generate_node_id(&self.state.nodes);
        let node = Node::new(new_id.clone(), Some(parent_id.to_string()), title);
        self.state.nodes.insert(new_id.clone(), node);
        if let Some(parent) = self.state.nodes.get_mut(parent_id) {
            parent.children_ids.push(new_id.clone());
        }
        self.state.focused_node_id = new_id.clone();
        self.state.ensure_focus();

        Ok(AddOutcome {
            new_node_id: new_id,
            state: self.get_state(),
        })
    }

    /// Adds a node after the last child of `node_id`'s parent (the root for a parentless node)
    pub fn add_sibling(&mut self, node_id: &str, title: &str) -> Result<AddOutcome, TreeError> {
        let parent_id = self.sibling_parent(node_id)?;
        self.add_child(&parent_id, title)
    }

    /// Resolves the parent a sibling of `node_id` would be created under
    pub fn sibling_parent(&self, node_id: &str) -> Result<NodeId, TreeError> {
        let node = self.require_active(node_id)?;
        Ok(node
            .parent_id
            .clone()
            .unwrap_or_else(|| self.state.root_id.clone()))
    }

    pub fn rename_node(&mut self, node_id: &str, title: &str) -> Result<TreeState, TreeError> {
        self.require_active(node_id)?;
        self.push_undo();

        if let Some(node) = self.state.nodes.get_mut(node_id) {
            node.title = sanitize_title(title);
            node.updated_at = Utc::now();
        }
        self.state.ensure_focus();
        Ok(self.get_state())
    }

    /// Moves focus; not recorded in the undo history
    pub fn focus_node(&mut self, node_id: &str) -> Result<TreeState, TreeError> {
        self.require_active(node_id)?;
        self.state.focused_node_id = node_id.to_string();
        Ok(self.get_state())
    }

    /// Marks a node done, returning focus to its parent
    pub fn complete_node(&mut self, node_id: &str) -> Result<RemoveOutcome, TreeError> {
        self.soft_delete(node_id)
    }

    /// Removes a node, returning focus to its parent
    pub fn delete_node(&mut self, node_id: &str) -> Result<RemoveOutcome, TreeError> {
        self.soft_delete(node_id)
    }

    pub fn undo(&mut self) -> TreeState {
        if let Some(previous) = self.state.undo_stack.pop() {
            let current = self.state.snapshot();
            self.state.redo_stack.push(current);
            self.state.apply_snapshot(previous);
            self.state.ensure_focus();
        }
        self.get_state()
    }

    pub fn redo(&mut self) -> TreeState {
        if let Some(next) = self.state.redo_stack.pop() {
            let current = self.state.snapshot();
            self.push_bounded_undo(current);
            self.state.apply_snapshot(next);
            self.state.ensure_focus();
        }
        self.get_state()
    }

    pub fn can_undo(&self) -> bool {
        !self.state.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.redo_stack.is_empty()
    }

    fn soft_delete(&mut self, node_id: &str) -> Result<RemoveOutcome, TreeError> {
        if node_id == self.state.root_id {
            return Err(TreeError::RootNodeProtected(node_id.to_string()));
        }
        let parent_id = self.require_active(node_id)?.parent_id.clone();
        self.push_undo();

        let doomed = self.collect_active_subtree(node_id);
        let now = Utc::now();
        for id in &doomed {
            if let Some(node) = self.state.nodes.get_mut(id) {
                node.status = NodeStatus::Deleted;
                node.deleted_at = Some(now);
                node.updated_at = now;
            }
        }

        if let Some(parent) = parent_id
            .as_deref()
            .and_then(|id| self.state.nodes.get_mut(id))
        {
            parent.children_ids.retain(|child| child != node_id);
        }

        self.state.focused_node_id = parent_id.unwrap_or_else(|| self.state.root_id.clone());
        self.state.ensure_focus();

        Ok(RemoveOutcome {
            next_focus_id: self.state.focused_node_id.clone(),
            state: self.get_state(),
        })
    }

    /// Collects `node_id` and all of its active descendants with an explicit worklist
    fn collect_active_subtree(&self, node_id: &str) -> Vec<NodeId> {
        let mut collected = Vec::new();
        let mut seen = HashSet::new();
        let mut worklist = vec![node_id.to_string()];
        while let Some(id) = worklist.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.state.active_node(&id) else {
                continue;
            };
            worklist.extend(
                node.children_ids
                    .iter()
                    .filter(|child| self.state.active_node(child).is_some())
                    .cloned(),
            );
            collected.push(id);
        }
        collected
    }

    fn require_active(&self, node_id: &str) -> Result<&Node, TreeError> {
        self.state
            .active_node(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))
    }

    /// Records the current tree before a new mutation, invalidating the redo future
    fn push_undo(&mut self) {
        let current = self.state.snapshot();
        self.push_bounded_undo(current);
        self.state.redo_stack.clear();
    }

    fn push_bounded_undo(&mut self, snapshot: Snapshot) {
        self.state.undo_stack.push(snapshot);
        if self.state.undo_stack.len() > self.undo_limit {
            let overflow = self.state.undo_stack.len() - self.undo_limit;
            self.state.undo_stack.drain(..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNTITLED_TASK;
    use pretty_assertions::assert_eq;

    fn machine() -> TreeMachine {
        TreeMachine::new(TreeState::fresh("test-session"))
    }

    #[test]
    fn test_add_child_focuses_new_node() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let outcome = m.add_child(&root, "  Plan trip ").unwrap();

        let node = outcome.state.node(&outcome.new_node_id).unwrap();
        assert_eq!(node.title, "Plan trip");
        assert_eq!(node.parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(outcome.state.focused_node_id, outcome.new_node_id);
        assert_eq!(
            outcome.state.node(&root).unwrap().children_ids,
            vec![outcome.new_node_id.clone()]
        );
        assert_eq!(outcome.state.undo_stack.len(), 1);
    }

    #[test]
    fn test_add_child_to_missing_parent_fails_without_mutation() {
        let mut m = machine();
        let before = m.get_state();
        assert_eq!(
            m.add_child("nope", "x").unwrap_err(),
            TreeError::NodeNotFound("nope".to_string())
        );
        assert_eq!(m.get_state(), before);
    }

    #[test]
    fn test_add_sibling_uses_parent_or_root() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        let b = m.add_child(&a, "B").unwrap().new_node_id;

        let c = m.add_sibling(&b, "C").unwrap();
        assert_eq!(
            c.state.node(&c.new_node_id).unwrap().parent_id.as_deref(),
            Some(a.as_str())
        );
        assert_eq!(c.state.node(&a).unwrap().children_ids, vec![b, c.new_node_id.clone()]);

        // Sibling of the root lands under the root
        let d = m.add_sibling(&root, "D").unwrap();
        assert_eq!(
            d.state.node(&d.new_node_id).unwrap().parent_id.as_deref(),
            Some(root.as_str())
        );
    }

    #[test]
    fn test_rename_sanitizes_and_bumps_updated_at() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        let created = m.state().node(&a).unwrap().updated_at;

        let state = m.rename_node(&a, "   ").unwrap();
        let node = state.node(&a).unwrap();
        assert_eq!(node.title, UNTITLED_TASK);
        assert!(node.updated_at >= created);
        assert_eq!(state.undo_stack.len(), 2);
    }

    #[test]
    fn test_focus_is_not_undoable() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        m.add_child(&root, "A").unwrap();
        let depth = m.state().undo_stack.len();

        let state = m.focus_node(&root).unwrap();
        assert_eq!(state.focused_node_id, root);
        assert_eq!(state.undo_stack.len(), depth);
        assert!(m.focus_node("missing").is_err());
    }

    #[test]
    fn test_complete_returns_to_parent() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        let b = m.add_child(&a, "B").unwrap().new_node_id;

        let outcome = m.complete_node(&b).unwrap();
        assert_eq!(outcome.next_focus_id, a);
        let deleted = outcome.state.node(&b).unwrap();
        assert_eq!(deleted.status, NodeStatus::Deleted);
        assert!(deleted.deleted_at.is_some());
        assert!(outcome.state.node(&a).unwrap().children_ids.is_empty());
    }

    #[test]
    fn test_delete_cascades_to_subtree() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        let b = m.add_child(&a, "B").unwrap().new_node_id;
        let c = m.add_child(&b, "C").unwrap().new_node_id;
        let d = m.add_child(&a, "D").unwrap().new_node_id;

        let outcome = m.delete_node(&a).unwrap();
        assert_eq!(outcome.next_focus_id, root);
        let stamp = outcome.state.node(&a).unwrap().deleted_at;
        for id in [&a, &b, &c, &d] {
            let node = outcome.state.node(id).unwrap();
            assert_eq!(node.status, NodeStatus::Deleted);
            assert_eq!(node.deleted_at, stamp);
        }
        // Descendants keep their structure under the deleted node
        assert_eq!(outcome.state.node(&a).unwrap().children_ids, vec![b.clone(), d]);
        assert!(outcome.state.node(&root).unwrap().children_ids.is_empty());
    }

    #[test]
    fn test_complete_and_delete_leave_the_same_tree() {
        let build = || {
            let mut m = machine();
            let root = m.state().root_id.clone();
            let a = m.add_child(&root, "A").unwrap().new_node_id;
            let b = m.add_child(&a, "B").unwrap().new_node_id;
            m.add_child(&b, "C").unwrap();
            m.add_child(&a, "D").unwrap();
            let e = m.add_child(&root, "E").unwrap().new_node_id;
            m.focus_node(&b).unwrap();
            (m, a, e)
        };
        let (mut completed, a, e) = build();
        // Same shape and ids in the second machine
        let mut deleted = TreeMachine::new(completed.get_state());

        let done = completed.complete_node(&a).unwrap();
        let gone = deleted.delete_node(&a).unwrap();

        assert_eq!(done.next_focus_id, gone.next_focus_id);
        assert_eq!(done.state.focused_node_id, gone.state.focused_node_id);
        assert_eq!(
            done.state.nodes.keys().collect::<Vec<_>>(),
            gone.state.nodes.keys().collect::<Vec<_>>()
        );
        for (id, node) in &done.state.nodes {
            let other = &gone.state.nodes[id];
            assert_eq!(node.status, other.status, "{}", id);
            assert_eq!(node.parent_id, other.parent_id, "{}", id);
            assert_eq!(node.children_ids, other.children_ids, "{}", id);
            assert_eq!(node.title, other.title, "{}", id);
            assert_eq!(node.deleted_at.is_some(), other.deleted_at.is_some(), "{}", id);
        }
        assert_eq!(done.state.walk_active().len(), 2);
        assert!(done.state.active_node(&e).is_some());
        assert_eq!(done.state.undo_stack, gone.state.undo_stack);
    }

    #[test]
    fn test_root_is_protected() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        m.add_child(&root, "A").unwrap();
        let before = m.get_state();

        assert_eq!(
            m.delete_node(&root).unwrap_err(),
            TreeError::RootNodeProtected(root.clone())
        );
        assert_eq!(
            m.complete_node(&root).unwrap_err(),
            TreeError::RootNodeProtected(root.clone())
        );
        assert_eq!(m.get_state(), before);
    }

    #[test]
    fn test_deleting_twice_fails() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        m.delete_node(&a).unwrap();
        assert_eq!(
            m.delete_node(&a).unwrap_err(),
            TreeError::NodeNotFound(a.clone())
        );
        assert_eq!(m.complete_node(&a).unwrap_err(), TreeError::NodeNotFound(a));
    }

    #[test]
    fn test_deleted_descendants_stay_deleted() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        let b = m.add_child(&a, "B").unwrap().new_node_id;
        let first = m.delete_node(&b).unwrap().state.node(&b).unwrap().deleted_at;

        let state = m.delete_node(&a).unwrap().state;
        let b_node = state.node(&b).unwrap();
        assert_eq!(b_node.status, NodeStatus::Deleted);
        // Already-deleted descendants are not collected again
        assert_eq!(b_node.deleted_at, first);
    }

    #[test]
    fn test_undo_redo_worked_example() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let a = m.add_child(&root, "A").unwrap().new_node_id;
        let b = m.add_child(&a, "B").unwrap().new_node_id;
        assert_eq!(m.state().focused_node_id, b);

        let done = m.complete_node(&b).unwrap();
        assert_eq!(done.next_focus_id, a);

        let undone = m.undo();
        assert_eq!(undone.node(&b).unwrap().status, NodeStatus::Active);
        assert_eq!(undone.focused_node_id, b);

        let redone = m.redo();
        assert_eq!(redone.node(&b).unwrap().status, NodeStatus::Deleted);
        assert_eq!(redone.focused_node_id, a);
    }

    #[test]
    fn test_undo_restores_exact_tree() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        m.add_child(&root, "A").unwrap();
        let before = m.state().snapshot();

        m.rename_node(&root, "Renamed").unwrap();
        let after = m.state().snapshot();
        m.undo();
        assert_eq!(m.state().snapshot(), before);
        m.redo();
        assert_eq!(m.state().snapshot(), after);
    }

    #[test]
    fn test_undo_and_redo_on_empty_stacks_are_noops() {
        let mut m = machine();
        let before = m.get_state();
        assert_eq!(m.undo(), before);
        assert_eq!(m.redo(), before);
        assert!(!m.can_undo());
        assert!(!m.can_redo());
    }

    #[test]
    fn test_new_mutation_clears_redo() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        m.add_child(&root, "A").unwrap();
        m.undo();
        assert!(m.can_redo());
        m.add_child(&root, "B").unwrap();
        assert!(!m.can_redo());
    }

    #[test]
    fn test_undo_stack_is_bounded() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let first = m.add_child(&root, "first").unwrap().new_node_id;
        for i in 0..UNDO_LIMIT {
            m.rename_node(&root, &format!("root {}", i)).unwrap();
        }
        assert_eq!(m.state().undo_stack.len(), UNDO_LIMIT);

        let mut steps = 0;
        while m.can_undo() {
            m.undo();
            steps += 1;
        }
        assert_eq!(steps, UNDO_LIMIT);
        // The state before the first command is gone; the node added by it survives
        assert!(m.state().active_node(&first).is_some());
    }

    #[test]
    fn test_loaded_state_is_normalized() {
        let mut state = TreeState::fresh("s");
        state.focused_node_id = "gone".to_string();
        let snap = state.snapshot();
        state.undo_stack = vec![snap; 5];

        let m = TreeMachine::with_undo_limit(state, 3);
        assert_eq!(m.state().focused_node_id, m.state().root_id);
        assert_eq!(m.state().undo_stack.len(), 3);
    }

    #[test]
    fn test_get_state_is_independent_copy() {
        let mut m = machine();
        let root = m.state().root_id.clone();
        let mut copy = m.get_state();
        copy.nodes.clear();
        m.add_child(&root, "A").unwrap();
        assert_eq!(m.state().nodes.len(), 2);
    }
}

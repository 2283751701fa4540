//! Command serializer
//!
//! [`Core`] is the facade the presentation layer calls into. Every call becomes one
//! command message on a channel drained by a single actor task, which owns the session
//! store and the tree machine. The actor finishes each command, including its disk
//! I/O, before it receives the next one, so mutations never overlap and the event log
//! records them in the order they were issued.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::machine::{AddOutcome, RemoveOutcome, TreeMachine};
use crate::models::{NodeId, TreeError, TreeState};
use crate::store::{EventAction, EventDetails, SessionStore, StoreError};

/// Errors surfaced to callers of [`Core`]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("The session has been shut down")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, CoreError>>;

/// One queued unit of work
enum Command {
    GetState(Reply<TreeState>),
    AddChild {
        parent_id: NodeId,
        title: String,
        reply: Reply<AddOutcome>,
    },
    AddSibling {
        node_id: NodeId,
        title: String,
        reply: Reply<AddOutcome>,
    },
    Rename {
        node_id: NodeId,
        title: String,
        reply: Reply<TreeState>,
    },
    Focus {
        node_id: NodeId,
        reply: Reply<TreeState>,
    },
    Complete {
        node_id: NodeId,
        reply: Reply<RemoveOutcome>,
    },
    Delete {
        node_id: NodeId,
        reply: Reply<RemoveOutcome>,
    },
    Undo(Reply<TreeState>),
    Redo(Reply<TreeState>),
    ListSessions(Reply<Vec<String>>),
    ReadEvents {
        session_id: String,
        reply: Reply<Vec<String>>,
    },
    ListSnapshots(Reply<Vec<String>>),
    ReadSnapshot {
        snapshot_id: String,
        reply: Reply<TreeState>,
    },
    SaveSession(Reply<TreeState>),
    RestoreSession {
        snapshot_id: String,
        reply: Reply<TreeState>,
    },
    Shutdown(Reply<()>),
}

/// Handle to the single in-process session. Cloning shares the same queue.
#[derive(Clone)]
pub struct Core {
    tx: mpsc::UnboundedSender<Command>,
    update_tx: Arc<broadcast::Sender<()>>,
}

impl Core {
    /// Initializes the session on disk and spawns the actor that serves commands
    pub async fn start(config: StoreConfig) -> Result<Self, CoreError> {
        let undo_limit = config.undo_limit;
        let mut store = SessionStore::new(config);
        let state = store.init_session().await?;
        let machine = TreeMachine::with_undo_limit(state, undo_limit);
        Ok(Self::spawn(store, machine))
    }

    /// Spawns the actor over an already-initialized store and machine
    pub fn spawn(store: SessionStore, machine: TreeMachine) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        // Create a broadcast channel with capacity for 100 messages
        let (update_tx, _rx) = broadcast::channel(100);
        let update_tx = Arc::new(update_tx);

        let session = Session {
            store,
            machine,
            update_tx: Arc::clone(&update_tx),
        };
        tokio::spawn(session.run(rx));

        Self { tx, update_tx }
    }

    /// Subscribe to state updates
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.update_tx.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| CoreError::Closed)?;
        rx.await.map_err(|_| CoreError::Closed)?
    }

    pub async fn get_state(&self) -> Result<TreeState, CoreError> {
        self.request(Command::GetState).await
    }

    pub async fn add_child(
        &self,
        parent_id: impl Into<NodeId>,
        title: impl Into<String>,
    ) -> Result<AddOutcome, CoreError> {
        let (parent_id, title) = (parent_id.into(), title.into());
        self.request(|reply| Command::AddChild {
            parent_id,
            title,
            reply,
        })
        .await
    }

    pub async fn add_sibling(
        &self,
        node_id: impl Into<NodeId>,
        title: impl Into<String>,
    ) -> Result<AddOutcome, CoreError> {
        let (node_id, title) = (node_id.into(), title.into());
        self.request(|reply| Command::AddSibling {
            node_id,
            title,
            reply,
        })
        .await
    }

    pub async fn rename_node(
        &self,
        node_id: impl Into<NodeId>,
        title: impl Into<String>,
    ) -> Result<TreeState, CoreError> {
        let (node_id, title) = (node_id.into(), title.into());
        self.request(|reply| Command::Rename {
            node_id,
            title,
            reply,
        })
        .await
    }

    pub async fn focus_node(&self, node_id: impl Into<NodeId>) -> Result<TreeState, CoreError> {
        let node_id = node_id.into();
        self.request(|reply| Command::Focus { node_id, reply }).await
    }

    pub async fn complete_node(
        &self,
        node_id: impl Into<NodeId>,
    ) -> Result<RemoveOutcome, CoreError> {
        let node_id = node_id.into();
        self.request(|reply| Command::Complete { node_id, reply })
            .await
    }

    pub async fn delete_node(
        &self,
        node_id: impl Into<NodeId>,
    ) -> Result<RemoveOutcome, CoreError> {
        let node_id = node_id.into();
        self.request(|reply| Command::Delete { node_id, reply }).await
    }

    pub async fn undo(&self) -> Result<TreeState, CoreError> {
        self.request(Command::Undo).await
    }

    pub async fn redo(&self) -> Result<TreeState, CoreError> {
        self.request(Command::Redo).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, CoreError> {
        self.request(Command::ListSessions).await
    }

    pub async fn read_events(
        &self,
        session_id: impl Into<String>,
    ) -> Result<Vec<String>, CoreError> {
        let session_id = session_id.into();
        self.request(|reply| Command::ReadEvents { session_id, reply })
            .await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<String>, CoreError> {
        self.request(Command::ListSnapshots).await
    }

    pub async fn read_snapshot(
        &self,
        snapshot_id: impl Into<String>,
    ) -> Result<TreeState, CoreError> {
        let snapshot_id = snapshot_id.into();
        self.request(|reply| Command::ReadSnapshot { snapshot_id, reply })
            .await
    }

    /// Flushes to disk and flags the session to be resumed on next start
    pub async fn save_session(&self) -> Result<TreeState, CoreError> {
        self.request(Command::SaveSession).await
    }

    /// Replaces the live session with a new one seeded from an archived snapshot
    pub async fn restore_session(
        &self,
        snapshot_id: impl Into<String>,
    ) -> Result<TreeState, CoreError> {
        let snapshot_id = snapshot_id.into();
        self.request(|reply| Command::RestoreSession { snapshot_id, reply })
            .await
    }

    /// Flushes pending writes and stops the actor. Later calls fail with [`CoreError::Closed`].
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.request(Command::Shutdown).await
    }
}

/// State owned by the actor task
struct Session {
    store: SessionStore,
    machine: TreeMachine,
    update_tx: Arc<broadcast::Sender<()>>,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if let Command::Shutdown(reply) = command {
                let result = self.store.flush_pending_state().await.map_err(CoreError::from);
                info!(session = %self.machine.session_id(), "Session shut down");
                let _ = reply.send(result);
                break;
            }
            self.handle(command).await;
        }
        // Reached when every handle is dropped without an explicit shutdown
        if let Err(e) = self.store.flush_pending_state().await {
            warn!("Final state flush failed: {}", e);
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::GetState(reply) => {
                let _ = reply.send(Ok(self.machine.get_state()));
            }
            Command::AddChild {
                parent_id,
                title,
                reply,
            } => {
                let result = self.add_child(&parent_id, &title).await;
                let _ = reply.send(result);
            }
            Command::AddSibling {
                node_id,
                title,
                reply,
            } => {
                let result = self.add_sibling(&node_id, &title).await;
                let _ = reply.send(result);
            }
            Command::Rename {
                node_id,
                title,
                reply,
            } => {
                let result = self.rename(&node_id, &title).await;
                let _ = reply.send(result);
            }
            Command::Focus { node_id, reply } => {
                let result = self.focus(&node_id).await;
                let _ = reply.send(result);
            }
            Command::Complete { node_id, reply } => {
                let result = self.remove(&node_id, EventAction::Complete).await;
                let _ = reply.send(result);
            }
            Command::Delete { node_id, reply } => {
                let result = self.remove(&node_id, EventAction::Delete).await;
                let _ = reply.send(result);
            }
            Command::Undo(reply) => {
                let changed = self.machine.can_undo();
                let state = self.machine.undo();
                let state = self
                    .after_history_step(EventAction::Undo, state, changed)
                    .await;
                let _ = reply.send(Ok(state));
            }
            Command::Redo(reply) => {
                let changed = self.machine.can_redo();
                let state = self.machine.redo();
                let state = self
                    .after_history_step(EventAction::Redo, state, changed)
                    .await;
                let _ = reply.send(Ok(state));
            }
            Command::ListSessions(reply) => {
                let _ = reply.send(self.store.list_sessions().await.map_err(CoreError::from));
            }
            Command::ReadEvents { session_id, reply } => {
                let result = self.store.read_events(&session_id).await;
                let _ = reply.send(result.map_err(CoreError::from));
            }
            Command::ListSnapshots(reply) => {
                let _ = reply.send(self.store.list_snapshots().await.map_err(CoreError::from));
            }
            Command::ReadSnapshot { snapshot_id, reply } => {
                let result = self.store.read_snapshot(&snapshot_id).await;
                let _ = reply.send(result.map_err(CoreError::from));
            }
            Command::SaveSession(reply) => {
                let _ = reply.send(self.save().await);
            }
            Command::RestoreSession { snapshot_id, reply } => {
                let result = self.restore(&snapshot_id).await;
                let _ = reply.send(result);
            }
            Command::Shutdown(reply) => {
                // Handled by the run loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn add_child(&mut self, parent_id: &str, title: &str) -> Result<AddOutcome, CoreError> {
        let outcome = self.machine.add_child(parent_id, title)?;
        self.log_node(EventAction::AddChild, &outcome.new_node_id, None)
            .await;
        self.commit(&outcome.state);
        Ok(outcome)
    }

    async fn add_sibling(&mut self, node_id: &str, title: &str) -> Result<AddOutcome, CoreError> {
        let outcome = self.machine.add_sibling(node_id, title)?;
        self.log_node(
            EventAction::AddSibling,
            &outcome.new_node_id,
            Some(format!("siblingOf={}", node_id)),
        )
        .await;
        self.commit(&outcome.state);
        Ok(outcome)
    }

    async fn rename(&mut self, node_id: &str, title: &str) -> Result<TreeState, CoreError> {
        let previous = self
            .machine
            .state()
            .active_node(node_id)
            .map(|node| node.title.clone());
        let state = self.machine.rename_node(node_id, title)?;
        let extra = previous.map(|old| format!("from=\"{}\"", crate::store::escape_title(&old)));
        self.log_node(EventAction::Rename, node_id, extra).await;
        self.commit(&state);
        Ok(state)
    }

    async fn focus(&mut self, node_id: &str) -> Result<TreeState, CoreError> {
        let state = self.machine.focus_node(node_id)?;
        self.log_node(EventAction::Focus, node_id, None).await;
        self.commit(&state);
        Ok(state)
    }

    /// Complete and delete share the tree mechanics; only the logged action differs
    async fn remove(
        &mut self,
        node_id: &str,
        action: EventAction,
    ) -> Result<RemoveOutcome, CoreError> {
        let details = self
            .machine
            .state()
            .active_node(node_id)
            .map(EventDetails::for_node);
        let outcome = match action {
            EventAction::Complete => self.machine.complete_node(node_id)?,
            _ => self.machine.delete_node(node_id)?,
        };

        self.store
            .append_event(action, details.unwrap_or_default())
            .await;
        self.log_node(EventAction::ReturnParent, &outcome.next_focus_id, None)
            .await;
        self.commit(&outcome.state);
        Ok(outcome)
    }

    /// Logs and persists an undo or redo; an empty stack leaves nothing to record
    async fn after_history_step(
        &mut self,
        action: EventAction,
        state: TreeState,
        changed: bool,
    ) -> TreeState {
        if !changed {
            return state;
        }
        let extra = format!(
            "undo={} redo={}",
            state.undo_stack.len(),
            state.redo_stack.len()
        );
        self.log_node(action, &state.focused_node_id, Some(extra)).await;
        self.commit(&state);
        state
    }

    async fn save(&mut self) -> Result<TreeState, CoreError> {
        self.store.flush_pending_state().await?;
        self.store.mark_continue().await?;
        let state = self.machine.get_state();
        self.log_node(EventAction::SessionSave, &state.focused_node_id, None)
            .await;
        Ok(state)
    }

    async fn restore(&mut self, snapshot_id: &str) -> Result<TreeState, CoreError> {
        self.store.flush_pending_state().await?;
        let state = self.store.restore_to_snapshot(snapshot_id).await?;
        let undo_limit = self.store.config().undo_limit;
        self.machine = TreeMachine::with_undo_limit(state, undo_limit);
        let _ = self.update_tx.send(());
        Ok(self.machine.get_state())
    }

    /// Appends an event describing `node_id` as it looks after the mutation
    async fn log_node(&self, action: EventAction, node_id: &str, extra: Option<String>) {
        let mut details = match self.machine.state().node(node_id) {
            Some(node) => EventDetails::for_node(node),
            None => EventDetails {
                node_id: Some(node_id.to_string()),
                ..EventDetails::default()
            },
        };
        details.extra = extra;
        self.store.append_event(action, details).await;
    }

    /// Schedules the debounced write and notifies subscribers
    fn commit(&self, state: &TreeState) {
        self.store.schedule_state_write(state);
        debug!(
            session = %state.session_id,
            nodes = state.nodes.len(),
            "Scheduled state write"
        );
        let _ = self.update_tx.send(());
    }
}

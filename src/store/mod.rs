//! Session store
//!
//! Owns everything taskstack keeps on disk for one installation:
//!
//! - `active.json`: the live [`TreeState`], replaced atomically
//! - `continue.flag`: its presence means "resume the active session on next start"
//! - `<session>.events.log`: append-only audit trail, one per session
//! - `<session>.snapshot.json`: the final state of an archived session

mod events;
mod writer;

pub use events::{escape_title, format_event_line, EventAction, EventDetails};

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::models::{Node, NodeId, TreeState};
use writer::StateWriter;

pub const ACTIVE_FILE: &str = "active.json";
pub const CONTINUE_FILE: &str = "continue.flag";
pub const EVENTS_SUFFIX: &str = ".events.log";
pub const SNAPSHOT_SUFFIX: &str = ".snapshot.json";

/// `YYYY-MM-DD_HH-mm-ss`, local time
const SESSION_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const SESSION_ID_LEN: usize = 19;

/// Errors from reading or writing session files
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not encode or decode state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session '{0}' not found")]
    SessionNotFound(String),
    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),
    #[error("Invalid session or snapshot id '{0}'")]
    InvalidId(String),
    #[error("{} does not hold a valid tree: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Translates between the in-memory tree and the files in the data directory
pub struct SessionStore {
    config: StoreConfig,
    session_id: Option<String>,
    writer: Arc<StateWriter>,
}

impl SessionStore {
    /// Opens a store over `config.data_dir`. Nothing is touched on disk until a session starts.
    pub fn new(config: StoreConfig) -> Self {
        let writer = StateWriter::new(config.data_dir.join(ACTIVE_FILE), config.debounce);
        Self {
            config,
            session_id: None,
            writer,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Id of the session whose event log receives appended events
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn active_path(&self) -> PathBuf {
        self.config.data_dir.join(ACTIVE_FILE)
    }

    pub fn continue_path(&self) -> PathBuf {
        self.config.data_dir.join(CONTINUE_FILE)
    }

    pub fn events_path(&self, session_id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}{}", session_id, EVENTS_SUFFIX))
    }

    pub fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}{}", snapshot_id, SNAPSHOT_SUFFIX))
    }

    /// How many times the active file has been written by this store
    pub fn state_write_count(&self) -> u64 {
        self.writer.write_count()
    }

    // Session lifecycle

    /// Resumes a flagged session, or archives the previous one and starts fresh
    pub async fn init_session(&mut self) -> Result<TreeState, StoreError> {
        let dir = self.config.data_dir.clone();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::io(&dir, source))?;

        if path_exists(&self.continue_path()).await {
            match self.restore_session().await {
                Ok(state) => return Ok(state),
                Err(e) => {
                    warn!("Could not resume saved session, starting a new one: {}", e);
                    if let Err(e) = self.clear_continue().await {
                        warn!("Could not clear continue flag: {}", e);
                    }
                }
            }
        }

        self.archive_active().await?;
        let session_id = self.allocate_session_id().await?;
        let state = TreeState::fresh(session_id.clone());
        self.session_id = Some(session_id.clone());
        self.write_state_now(&state).await?;
        self.append_event(EventAction::SessionStart, root_details(&state))
            .await;

        info!(session = %session_id, "Started new session");
        Ok(state)
    }

    /// Loads `active.json` verbatim and continues its session and event log
    pub async fn restore_session(&mut self) -> Result<TreeState, StoreError> {
        let path = self.active_path();
        let state = read_state_file(&path)
            .await?
            .ok_or_else(|| StoreError::io(&path, io::ErrorKind::NotFound.into()))?;

        self.session_id = Some(state.session_id.clone());
        self.clear_continue().await?;
        self.append_event(EventAction::SessionResume, root_details(&state))
            .await;

        info!(session = %state.session_id, "Resumed saved session");
        Ok(state)
    }

    /// Starts a new session from an archived snapshot's tree.
    ///
    /// Focus returns to the root and both history stacks start empty; the old session's
    /// event log is left alone and a new one is opened.
    pub async fn restore_to_snapshot(
        &mut self,
        snapshot_id: &str,
    ) -> Result<TreeState, StoreError> {
        let snapshot = self.read_snapshot(snapshot_id).await?;

        // A late debounced write must not land on top of the new session
        self.flush_pending_state().await?;
        self.archive_active().await?;
        self.clear_continue().await?;

        let session_id = self.allocate_session_id().await?;
        let state = TreeState {
            session_id: session_id.clone(),
            focused_node_id: snapshot.root_id.clone(),
            root_id: snapshot.root_id,
            nodes: snapshot.nodes,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        };
        self.session_id = Some(session_id.clone());
        self.write_state_now(&state).await?;
        self.append_event(
            EventAction::SessionRestoredFrom,
            root_details(&state).with_extra(format!("snapshot={}", snapshot_id)),
        )
        .await;

        info!(session = %session_id, snapshot = %snapshot_id, "Restored session from snapshot");
        Ok(state)
    }

    /// Moves `active.json` aside as `<session>.snapshot.json`, returning the snapshot id
    async fn archive_active(&self) -> Result<Option<String>, StoreError> {
        let active = self.active_path();
        if !path_exists(&active).await {
            return Ok(None);
        }

        let base = match read_state_file(&active).await {
            Ok(Some(state)) => state.session_id,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Archiving unreadable active state: {}", e);
                timestamp_id()
            }
        };
        let base = if validate_id(&base).is_ok() {
            base
        } else {
            timestamp_id()
        };
        let snapshot_id = self.unique_id(&base, SNAPSHOT_SUFFIX).await;
        let target = self.snapshot_path(&snapshot_id);
        fs::rename(&active, &target)
            .await
            .map_err(|source| StoreError::io(&target, source))?;

        info!(snapshot = %snapshot_id, "Archived previous session");
        Ok(Some(snapshot_id))
    }

    /// A timestamp id that no existing event log already uses
    async fn allocate_session_id(&self) -> Result<String, StoreError> {
        Ok(self.unique_id(&timestamp_id(), EVENTS_SUFFIX).await)
    }

    /// `base`, or `base-1`, `base-2`, … whichever has no file with `suffix` yet
    async fn unique_id(&self, base: &str, suffix: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 0u32;
        while path_exists(&self.config.data_dir.join(format!("{}{}", candidate, suffix))).await {
            n += 1;
            candidate = format!("{}-{}", base, n);
        }
        candidate
    }

    // State persistence

    /// Writes the full state now, atomically replacing `active.json`
    pub async fn write_state_now(&self, state: &TreeState) -> Result<(), StoreError> {
        self.writer.write_now(state).await
    }

    /// Queues a copy of `state` for the next debounced write
    pub fn schedule_state_write(&self, state: &TreeState) {
        self.writer.schedule(state.clone());
    }

    /// Writes any pending state immediately; on return the file matches the last schedule
    pub async fn flush_pending_state(&self) -> Result<(), StoreError> {
        self.writer.flush().await
    }

    pub fn has_pending_write(&self) -> bool {
        self.writer.has_pending()
    }

    // Audit trail

    /// Appends one record to the current session's log. Failures are logged, never raised.
    pub async fn append_event(&self, action: EventAction, details: EventDetails) {
        let Some(session_id) = self.session_id.as_deref() else {
            warn!("No active session, dropping {} event", action);
            return;
        };
        let line = format_event_line(Utc::now(), action, &details);
        let path = self.events_path(session_id);
        match append_line(&path, &line).await {
            Ok(()) => debug!("{}", line),
            Err(e) => warn!("Could not append to event log {}: {}", path.display(), e),
        }
    }

    // Continue marker

    pub async fn mark_continue(&self) -> Result<(), StoreError> {
        let path = self.continue_path();
        fs::write(&path, b"")
            .await
            .map_err(|source| StoreError::io(&path, source))
    }

    pub async fn clear_continue(&self) -> Result<(), StoreError> {
        let path = self.continue_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::io(&path, source)),
        }
    }

    pub async fn has_continue_flag(&self) -> bool {
        path_exists(&self.continue_path()).await
    }

    // History browsing

    /// Session ids with an event log, newest first
    pub async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        self.list_ids(EVENTS_SUFFIX).await
    }

    /// Non-empty, trimmed lines of a session's event log
    pub async fn read_events(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        validate_id(session_id)?;
        let path = self.events_path(session_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::SessionNotFound(session_id.to_string()))
            }
            Err(source) => return Err(StoreError::io(&path, source)),
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Archived snapshot ids, newest first
    pub async fn list_snapshots(&self) -> Result<Vec<String>, StoreError> {
        self.list_ids(SNAPSHOT_SUFFIX).await
    }

    pub async fn read_snapshot(&self, snapshot_id: &str) -> Result<TreeState, StoreError> {
        validate_id(snapshot_id)?;
        read_state_file(&self.snapshot_path(snapshot_id))
            .await?
            .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))
    }

    async fn list_ids(&self, suffix: &str) -> Result<Vec<String>, StoreError> {
        let dir = &self.config.data_dir;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::io(dir, source)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::io(dir, source))?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(suffix) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        sort_newest_first(&mut ids);
        Ok(ids)
    }
}

fn timestamp_id() -> String {
    Local::now().format(SESSION_ID_FORMAT).to_string()
}

/// Orders ids by their timestamp part, then by numeric collision suffix
fn id_sort_key(id: &str) -> (&str, u64, &str) {
    if let (Some(base), Some(rest)) = (id.get(..SESSION_ID_LEN), id.get(SESSION_ID_LEN..)) {
        if rest.is_empty() {
            return (base, 0, "");
        }
        if let Some(n) = rest.strip_prefix('-').and_then(|n| n.parse::<u64>().ok()) {
            return (base, n, "");
        }
    }
    (id, 0, id)
}

fn sort_newest_first(ids: &mut [String]) {
    ids.sort_by(|a, b| id_sort_key(b).cmp(&id_sort_key(a)));
}

/// Rejects ids that could name a path outside the data directory
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let invalid = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
        || id.contains("..");
    if invalid {
        Err(StoreError::InvalidId(id.to_string()))
    } else {
        Ok(())
    }
}

/// Checks the structural invariants a loaded state must satisfy, including every
/// tree held on its undo and redo stacks
fn validate_state(state: &TreeState) -> Result<(), String> {
    validate_id(&state.session_id).map_err(|e| e.to_string())?;
    validate_tree(&state.root_id, &state.nodes)?;
    for snapshot in state.undo_stack.iter().chain(&state.redo_stack) {
        validate_tree(&snapshot.root_id, &snapshot.nodes)
            .map_err(|reason| format!("history entry: {}", reason))?;
    }
    Ok(())
}

fn validate_tree(root_id: &str, nodes: &BTreeMap<NodeId, Node>) -> Result<(), String> {
    let root = nodes
        .get(root_id)
        .ok_or_else(|| format!("root '{}' is missing", root_id))?;
    if root.parent_id.is_some() {
        return Err(format!("root '{}' has a parent", root.id));
    }
    if !root.is_active() {
        return Err(format!("root '{}' is deleted", root.id));
    }

    let mut listed = HashSet::new();
    for (id, node) in nodes {
        if id != &node.id {
            return Err(format!("node key '{}' does not match id '{}'", id, node.id));
        }
        if id != root_id {
            match node.parent_id.as_deref() {
                Some(parent) if nodes.contains_key(parent) => {}
                _ => return Err(format!("node '{}' has no valid parent", id)),
            }
        }
        for child in &node.children_ids {
            let child_node = nodes
                .get(child)
                .ok_or_else(|| format!("node '{}' lists missing child '{}'", id, child))?;
            if child_node.parent_id.as_deref() != Some(id.as_str()) {
                return Err(format!("node '{}' lists '{}', which is not its child", id, child));
            }
            if !listed.insert(child.as_str()) {
                return Err(format!("child '{}' is listed twice", child));
            }
        }
    }

    // Every parent chain has to end at the root
    for id in nodes.keys() {
        let mut current = id.as_str();
        let mut steps = 0;
        while current != root_id {
            steps += 1;
            if steps > nodes.len() {
                return Err(format!("node '{}' is part of a parent cycle", id));
            }
            current = nodes
                .get(current)
                .and_then(|node| node.parent_id.as_deref())
                .unwrap_or(root_id);
        }
    }
    Ok(())
}

/// Reads and validates a state file; `Ok(None)` when the file does not exist
async fn read_state_file(path: &Path) -> Result<Option<TreeState>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::io(path, source)),
    };
    let state: TreeState = serde_json::from_str(&text)?;
    validate_state(&state).map_err(|reason| StoreError::CorruptState {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(Some(state))
}

async fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

fn root_details(state: &TreeState) -> EventDetails {
    state
        .node(&state.root_id)
        .map(EventDetails::for_node)
        .unwrap_or_else(|| EventDetails {
            node_id: Some(state.root_id.clone()),
            ..EventDetails::default()
        })
}

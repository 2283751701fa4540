//! Atomic and debounced writes of the active state file

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::StoreError;
use crate::models::TreeState;

/// Latest unwritten state plus the timer that will write it
#[derive(Default)]
struct PendingSlot {
    state: Option<TreeState>,
    timer: Option<JoinHandle<()>>,
}

/// Single writer of one state file.
///
/// Direct writes, debounced writes and flushes all take the `io` lock, so at most one
/// write to the file is in progress and a flush returns only after earlier writes land.
pub(crate) struct StateWriter {
    path: PathBuf,
    debounce: Duration,
    slot: Mutex<PendingSlot>,
    io: tokio::sync::Mutex<()>,
    writes: AtomicU64,
}

impl StateWriter {
    pub(crate) fn new(path: PathBuf, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            path,
            debounce,
            slot: Mutex::new(PendingSlot::default()),
            io: tokio::sync::Mutex::new(()),
            writes: AtomicU64::new(0),
        })
    }

    /// Number of completed writes to the state file
    pub(crate) fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) async fn write_now(&self, state: &TreeState) -> Result<(), StoreError> {
        let _io = self.io.lock().await;
        self.write_locked(state).await
    }

    /// Records `state` as pending and arms the timer unless one is already armed.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn schedule(self: &Arc<Self>, state: TreeState) {
        let mut slot = self.lock_slot();
        slot.state = Some(state);
        if slot.timer.is_none() {
            let writer = Arc::clone(self);
            slot.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(writer.debounce).await;
                writer.fire().await;
            }));
        }
    }

    /// Cancels the timer and writes whatever is pending right away
    pub(crate) async fn flush(&self) -> Result<(), StoreError> {
        let pending = {
            let mut slot = self.lock_slot();
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.state.take()
        };

        // Taking the lock also waits out a timer write that already started
        let _io = self.io.lock().await;
        match pending {
            Some(state) => self.write_locked(&state).await,
            None => Ok(()),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.lock_slot().state.is_some()
    }

    async fn fire(&self) {
        let _io = self.io.lock().await;
        let pending = {
            let mut slot = self.lock_slot();
            slot.timer = None;
            slot.state.take()
        };
        let Some(state) = pending else {
            return;
        };
        match self.write_locked(&state).await {
            Ok(()) => debug!(path = %self.path.display(), "Debounced state write complete"),
            Err(e) => {
                error!("Debounced state write failed: {}", e);
                // Keep it for the next flush unless a newer state has been scheduled
                let mut slot = self.lock_slot();
                if slot.state.is_none() {
                    slot.state = Some(state);
                }
            }
        }
    }

    async fn write_locked(&self, state: &TreeState) -> Result<(), StoreError> {
        atomic_write_json(&self.path, state).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lock_slot(&self) -> MutexGuard<'_, PendingSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Writes `state` as pretty JSON to a temp file next to `path`, then renames it into place
pub(crate) async fn atomic_write_json(path: &Path, state: &TreeState) -> Result<(), StoreError> {
    let mut json = serde_json::to_string_pretty(state)?;
    json.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    write_synced(&tmp_path, json.as_bytes())
        .await
        .map_err(|source| StoreError::io(&tmp_path, source))?;
    replace_file(&tmp_path, path).await
}

/// Writes `bytes` and syncs them to disk before returning
async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Renames `from` over `to`. On a destination conflict the destination is removed and
/// the rename retried once.
pub(crate) async fn replace_file(from: &Path, to: &Path) -> Result<(), StoreError> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) if is_conflict(&err) => {
            warn!(
                path = %to.display(),
                "Rename over existing file failed ({}), removing destination and retrying",
                err
            );
            match fs::remove_file(to).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(to, e)),
            }
            fs::rename(from, to)
                .await
                .map_err(|source| StoreError::io(to, source))
        }
        Err(source) => Err(StoreError::io(to, source)),
    }
}

fn is_conflict(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AlreadyExists | io::ErrorKind::PermissionDenied
    )
}

// Media Cache (spec §4.2) — scoped acquisition of downloaded images/videos
// on disk, reference-counted, with atomic writes. Grounded on the teacher's
// filesystem-handling style in engine/workspace.rs (per-owner directories,
// `std::fs::create_dir_all`, path validation) generalized here to reference
// counting rather than a single fixed owner.

use crate::error::EngineResult;
use crate::types::MediaHandle;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Grace period before an unreferenced file from a previous run is unlinked,
/// to tolerate crash races between a write and its owning record/state being
/// persisted (spec §4.2, §7 "Startup inconsistency").
pub const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Any distinct caller that can hold a reference to a media handle: a live
/// FlowState (by operator+kind) or a persisted broadcast id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum MediaOwner {
    Flow { operator: String, kind: &'static str },
    Broadcast(i64),
    /// Placeholder owner used only during startup reconciliation for a file
    /// whose path matches a persisted broadcast's media_paths column — the
    /// exact broadcast id isn't resolved at that point, only "is referenced".
    Persisted,
}

struct Entry {
    path: PathBuf,
    owners: HashSet<MediaOwner>,
}

pub struct MediaCache {
    dir: PathBuf,
    entries: Mutex<HashMap<MediaHandle, Entry>>,
}

impl MediaCache {
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(MediaCache { dir, entries: Mutex::new(HashMap::new()) })
    }

    /// Write `bytes` to a new file under the media directory, atomically
    /// (temp file then rename), and register it as unowned until `attach`
    /// is called.
    pub fn acquire(&self, bytes: &[u8], extension: &str) -> EngineResult<(MediaHandle, PathBuf)> {
        let id = Uuid::new_v4().to_string();
        let file_name = format!("{id}.{extension}");
        let final_path = self.dir.join(&file_name);
        let tmp_path = self.dir.join(format!("{file_name}.tmp"));

        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;

        let handle = MediaHandle(file_name);
        self.entries.lock().insert(
            handle.clone(),
            Entry { path: final_path.clone(), owners: HashSet::new() },
        );
        info!("[media] acquired {:?} ({} bytes)", handle, bytes.len());
        Ok((handle, final_path))
    }

    pub fn path_of(&self, handle: &MediaHandle) -> Option<PathBuf> {
        self.entries.lock().get(handle).map(|e| e.path.clone())
    }

    /// Register `owner` as holding `handle`. No-op if the handle is unknown
    /// (e.g. after a restart — callers should re-register known paths via
    /// `register_existing` first).
    pub fn attach(&self, handle: &MediaHandle, owner: MediaOwner) {
        if let Some(entry) = self.entries.lock().get_mut(handle) {
            entry.owners.insert(owner);
        }
    }

    /// Drop `owner`'s reference. If the reference count reaches zero the
    /// file is unlinked immediately (spec §4.2 `release`).
    pub fn detach(&self, handle: &MediaHandle, owner: &MediaOwner) {
        let should_unlink = {
            let mut entries = self.entries.lock();
            match entries.get_mut(handle) {
                Some(entry) => {
                    entry.owners.remove(owner);
                    entry.owners.is_empty()
                }
                None => false,
            }
        };
        if should_unlink {
            self.release(handle);
        }
    }

    /// Unconditionally unlink the file backing `handle` and forget it.
    pub fn release(&self, handle: &MediaHandle) {
        let path = self.entries.lock().remove(handle).map(|e| e.path);
        if let Some(path) = path {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("[media] failed to unlink {:?}: {}", path, e);
                }
            } else {
                info!("[media] released {:?}", path);
            }
        }
    }

    /// Reconcile the media directory on startup: re-register every file
    /// referenced by a persisted broadcast path, then unlink anything older
    /// than the grace period that is still unowned (spec §4.2, §7).
    pub fn reconcile(&self, persisted_paths: &HashSet<PathBuf>) -> EngineResult<()> {
        let now = SystemTime::now();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if persisted_paths.contains(&path) {
                self.entries.lock().insert(
                    MediaHandle(file_name),
                    Entry { path: path.clone(), owners: HashSet::from([MediaOwner::Persisted]) },
                );
                continue;
            }
            let metadata = entry.metadata()?;
            let age = now.duration_since(metadata.modified()?).unwrap_or(Duration::ZERO);
            if age >= STARTUP_GRACE_PERIOD {
                warn!("[media] unreferenced file past grace period, deleting: {:?}", path);
                std::fs::remove_file(&path).ok();
            } else {
                // Not yet referenced, not yet old enough — keep it unowned
                // in memory so a subsequent attach() can find it.
                self.entries.lock().insert(
                    MediaHandle(file_name),
                    Entry { path, owners: HashSet::new() },
                );
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Unconditionally release every handle in `handles` — used when a
    /// FlowState terminates by cancellation, expiry, or restart-from-scratch
    /// (spec §3.9: media owned by a FlowState is released unless it has
    /// moved to a persisted record or a schedule burst).
    pub fn release_all(&self, handles: &[MediaHandle]) {
        for handle in handles {
            self.release(handle);
        }
    }
}

impl std::fmt::Debug for MediaOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaOwner::Flow { operator, kind } => write!(f, "Flow({operator}, {kind})"),
            MediaOwner::Broadcast(id) => write!(f, "Broadcast({id})"),
            MediaOwner::Persisted => write!(f, "Persisted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_file_and_attach_detach_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path()).unwrap();
        let (handle, path) = cache.acquire(b"hello", "jpg").unwrap();
        assert!(path.exists());

        let owner_a = MediaOwner::Flow { operator: "op1".into(), kind: "forward" };
        let owner_b = MediaOwner::Broadcast(42);
        cache.attach(&handle, owner_a.clone());
        cache.attach(&handle, owner_b.clone());

        cache.detach(&handle, &owner_a);
        assert!(path.exists(), "file must survive while broadcast owner remains");

        cache.detach(&handle, &owner_b);
        assert!(!path.exists(), "file must be unlinked once refcount reaches zero");
    }

    #[test]
    fn release_unlinks_regardless_of_owners() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path()).unwrap();
        let (handle, path) = cache.acquire(b"data", "png").unwrap();
        cache.attach(&handle, MediaOwner::Broadcast(1));
        cache.release(&handle);
        assert!(!path.exists());
    }
}

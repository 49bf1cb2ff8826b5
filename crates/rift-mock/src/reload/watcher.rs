//! File-system watching for rule directories.

use super::{ChangeKind, ReloadHandle};
use crate::loader::is_rule_file;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Watches every directory under the given roots and forwards rule-file
/// changes to a [`ReloadHandle`]. Directories created later are picked up
/// as they appear. Watching stops when the value is dropped.
pub struct FsWatcher {
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl FsWatcher {
    pub fn start(roots: &[PathBuf], handle: ReloadHandle) -> notify::Result<Self> {
        // Watches cannot be added from inside the event callback, which runs
        // on the watcher's own thread; new directories go through a channel.
        let (dir_tx, dir_rx) = std_mpsc::channel::<PathBuf>();

        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("File watcher error: {}", e);
                    return;
                }
            };
            let Some(kind) = classify(&event.kind) else {
                return;
            };

            for path in &event.paths {
                if kind == ChangeKind::Created && path.is_dir() {
                    let _ = dir_tx.send(path.clone());
                    // Files may have landed before the directory was watched
                    handle.on_change(path, kind);
                } else if is_rule_file(path) || kind == ChangeKind::Removed {
                    handle.on_change(path, kind);
                }
            }
        })?;

        let watcher = Arc::new(Mutex::new(watcher));
        {
            let mut guard = watcher.lock();
            for root in roots {
                watch_root(&mut guard, root)?;
                info!("Watching rule directory {}", root.display());
            }
        }

        let registrar = Arc::downgrade(&watcher);
        thread::Builder::new()
            .name("rift-mock-watch".to_string())
            .spawn(move || {
                while let Ok(dir) = dir_rx.recv() {
                    let Some(watcher) = registrar.upgrade() else {
                        break;
                    };
                    watch_tree(&mut watcher.lock(), &dir);
                }
            })
            .map_err(notify::Error::io)?;

        Ok(Self { _watcher: watcher })
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

/// Watch a configured root. Failing to watch the root itself is an error;
/// subdirectories below it are best effort.
fn watch_root(watcher: &mut RecommendedWatcher, root: &Path) -> notify::Result<()> {
    if !root.is_dir() {
        return Err(notify::Error::path_not_found().add_path(root.to_path_buf()));
    }
    watcher.watch(root, RecursiveMode::NonRecursive)?;
    watch_children(watcher, root);
    Ok(())
}

/// Watch `dir` and every directory below it, each non-recursively.
fn watch_tree(watcher: &mut RecommendedWatcher, dir: &Path) {
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!("Failed to watch {}: {}", dir.display(), e);
        return;
    }
    debug!("Watching {}", dir.display());
    watch_children(watcher, dir);
}

fn watch_children(watcher: &mut RecommendedWatcher, dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            watch_tree(watcher, &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(classify(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }

    #[test]
    fn test_missing_root_fails_to_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = ReloadHandle { tx };
        let err = FsWatcher::start(&[dir.path().to_path_buf(), missing.clone()], handle)
            .err()
            .expect("missing root must be rejected");
        assert!(matches!(err.kind, notify::ErrorKind::PathNotFound));
        assert_eq!(err.paths, vec![missing]);
    }
}

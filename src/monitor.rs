//! Source-tree change monitor (C5): a recursive, inotify-backed watch over
//! the base directory that eagerly materialises new qualifying files and
//! invalidates cache entries on deletion.

use crate::filter::FilterRules;
use crate::options::Config;
use crate::vfile::VirtualFile;
use camino::{Utf8Path, Utf8PathBuf};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stands in for the kernel's inotify watch descriptor: `notify`'s portable
/// API doesn't expose raw descriptors, so watches are identified by a
/// locally assigned, monotonically increasing id (SPEC_FULL.md §4.5,
/// `DESIGN.md` Open Question #1).
pub type WatchId = u64;

struct WatchEntry {
    path: Utf8PathBuf,
    /// True if the underlying `notify` watch could not be installed
    /// (resource exhaustion) and is waiting for a slot to free up.
    pending: bool,
}

struct WatchTable {
    next_id: WatchId,
    entries: BTreeMap<WatchId, WatchEntry>,
}

impl WatchTable {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, path: Utf8PathBuf, pending: bool) -> WatchId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, WatchEntry { path, pending });
        id
    }

    /// Remove every entry whose path has `root` as a string prefix
    /// (mirroring the original's `strncmp` semantics exactly, including its
    /// lack of path-component awareness). Returns the ids removed that had a
    /// live (non-pending) watch, for `unwatch` and slot-recycling.
    fn remove_prefix(&mut self, root: &Utf8Path) -> Vec<(WatchId, Utf8PathBuf)> {
        let root_str = root.as_str();
        let to_remove: Vec<WatchId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.path.as_str().starts_with(root_str))
            .map(|(id, _)| *id)
            .collect();

        let mut released = Vec::new();
        for id in to_remove {
            if let Some(entry) = self.entries.remove(&id) {
                if !entry.pending {
                    released.push((id, entry.path));
                }
            }
        }
        released
    }

    /// Path registered for watch id `id`, if any -- used to resolve an
    /// event's watched directory.
    fn find_by_path(&self, path: &Utf8Path) -> bool {
        self.entries.values().any(|e| e.path == path)
    }

    fn pending_ids_in_order(&self) -> Vec<WatchId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.pending)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Handle to a running monitor thread.
pub struct Monitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Monitor {
    pub fn spawn(config: Arc<Config>, filter: Arc<FilterRules>) -> anyhow::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| crate::anyhow_loc!("failed to initialize watch channel: {}", e))?;

        let watch_table = Arc::new(Mutex::new(WatchTable::new()));
        let watcher = Arc::new(Mutex::new(watcher));

        // Initial recursive scan: watch the root and every subdirectory
        // individually (NonRecursive per directory), so the watch table's
        // sentinel/slot-recycling bookkeeping stays meaningful.
        add_directory_tree(&config.base_dir, &watcher, &watch_table);

        let thread_stop = stop_flag.clone();
        let handle = std::thread::spawn(move || {
            run(config, filter, rx, watcher, watch_table, thread_stop);
        });

        Ok(Monitor {
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Install a watch on `dir` and, recursively, on every subdirectory beneath
/// it. Directories whose watch can't be installed (resource exhaustion) are
/// recorded as pending.
fn add_directory_tree(dir: &Utf8Path, watcher: &Arc<Mutex<RecommendedWatcher>>, table: &Arc<Mutex<WatchTable>>) {
    let _ = crate::pathutil::dir_visit(dir, None, |entry| {
        if entry.is_dir {
            try_watch(&entry.path, watcher, table);
        }
        Ok(crate::pathutil::Visit::Continue)
    });
    try_watch(dir, watcher, table);
}

fn try_watch(dir: &Utf8Path, watcher: &Arc<Mutex<RecommendedWatcher>>, table: &Arc<Mutex<WatchTable>>) {
    let mut t = table.lock().unwrap();
    if t.find_by_path(dir) {
        return;
    }
    drop(t);

    let result = watcher
        .lock()
        .unwrap()
        .watch(dir.as_std_path(), RecursiveMode::NonRecursive);

    t = table.lock().unwrap();
    match result {
        Ok(()) => {
            t.insert(dir.to_path_buf(), false);
            tracing::debug!(dir = %dir, "added watch");
        }
        Err(e) => {
            t.insert(dir.to_path_buf(), true);
            tracing::debug!(dir = %dir, error = %e, "pending adding watch when resource available");
        }
    }
}

fn remove_directory(
    root: &Utf8Path,
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    table: &Arc<Mutex<WatchTable>>,
) {
    let released = {
        let mut t = table.lock().unwrap();
        t.remove_prefix(root)
    };

    let mut watches_released = 0usize;
    {
        let mut w = watcher.lock().unwrap();
        for (_, path) in &released {
            match w.unwatch(path.as_std_path()) {
                Ok(()) => watches_released += 1,
                Err(e) => tracing::warn!(dir = %path, error = %e, "unable to remove watch"),
            }
        }
    }

    // For every released watch, retry one pending directory, in watch-id
    // order (earliest pending first).
    let mut remaining = watches_released;
    while remaining > 0 {
        let next_pending = {
            let t = table.lock().unwrap();
            t.pending_ids_in_order().into_iter().next()
        };
        let Some(id) = next_pending else { break };
        let path = {
            let t = table.lock().unwrap();
            t.entries.get(&id).map(|e| e.path.clone())
        };
        let Some(path) = path else { break };

        let result = watcher.lock().unwrap().watch(path.as_std_path(), RecursiveMode::NonRecursive);
        let mut t = table.lock().unwrap();
        match result {
            Ok(()) => {
                if let Some(entry) = t.entries.get_mut(&id) {
                    entry.pending = false;
                }
                remaining -= 1;
                tracing::debug!(dir = %path, "added watch for pending directory");
            }
            Err(_) => break, // still exhausted; stop for this release batch
        }
    }
}

fn run(
    config: Arc<Config>,
    filter: Arc<FilterRules>,
    rx: Receiver<notify::Result<Event>>,
    watcher: Arc<Mutex<RecommendedWatcher>>,
    table: Arc<Mutex<WatchTable>>,
    stop: Arc<AtomicBool>,
) {
    tracing::debug!("monitor run");
    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(event)) => {
                let _timer = crate::timed_span!(tracing::Level::DEBUG, "monitor_event");
                handle_event(&config, &filter, &event, &watcher, &table);
                // `config`/`filter` are `Arc`s; `VirtualFile` clones them per call.
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "watch channel error");
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("monitor exit");
}

fn handle_event(
    config: &Arc<Config>,
    filter: &Arc<FilterRules>,
    event: &Event,
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    table: &Arc<Mutex<WatchTable>>,
) {
    let is_create_like = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    );
    let is_modify_like = matches!(event.kind, EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any));
    let is_remove_like = matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
    );

    for path in &event.paths {
        let Some(path) = Utf8Path::from_path(path) else { continue };
        // Normalise a root watch path of "/" so composed children never
        // read as "//name" (SPEC_FULL.md §9 "Event-name concatenation").
        let path = if path.as_str().is_empty() { Utf8Path::new("/") } else { path };

        if is_create_like || is_modify_like {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    let vf = VirtualFile::from_src(path, config, filter);
                    if let Err(e) = vf.classify() {
                        tracing::warn!(file = %path, error = %e, "monitor failed to stat corresponding mount path");
                    } else {
                        tracing::debug!(file = %path, "new file cached");
                    }
                }
                Ok(meta) if meta.is_dir() => {
                    add_directory_tree(path, watcher, table);
                    tracing::debug!(dir = %path, "new directory watched");
                }
                _ => {}
            }
        } else if is_remove_like {
            let was_watched_dir = table.lock().unwrap().find_by_path(path);
            if was_watched_dir {
                remove_directory(path, watcher, table);
                tracing::debug!(dir = %path, "directory removed");
            } else {
                let vf = VirtualFile::from_src(path, config, filter);
                if let Err(e) = vf.decache() {
                    tracing::error!(file = %path, error = %e, "failed to decache");
                } else {
                    tracing::debug!(file = %path, "decached");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_table_remove_prefix_matches_string_prefix() {
        let mut table = WatchTable::new();
        table.insert(Utf8PathBuf::from("/in/a"), false);
        table.insert(Utf8PathBuf::from("/in/a/b"), false);
        table.insert(Utf8PathBuf::from("/in/ax"), false);
        table.insert(Utf8PathBuf::from("/in/other"), false);

        let released = table.remove_prefix(Utf8Path::new("/in/a"));
        // String-prefix semantics (faithful to the original's strncmp): both
        // "/in/a/b" and "/in/ax" match the prefix "/in/a".
        assert_eq!(released.len(), 3);
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn pending_retry_consumes_one_slot_per_release() {
        let mut table = WatchTable::new();
        let id1 = table.insert(Utf8PathBuf::from("/p/one"), true);
        let id2 = table.insert(Utf8PathBuf::from("/p/two"), true);
        assert_eq!(table.pending_ids_in_order(), vec![id1, id2]);
    }
}

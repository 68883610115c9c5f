//! Cache eviction engine (C4): a background thread that enforces size,
//! entry-count, and age bounds on the cache directory, ordered by access
//! time.

use camino::{Utf8Path, Utf8PathBuf};
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

pub const SLEEP_MIN: u64 = 2;
pub const SLEEP_MAX: u64 = 64;

struct CullEntry {
    name: String,
    size_bytes: u64,
    atime: SystemTime,
}

/// Bounds the cleaner enforces. At least one must be enabled (> 0).
#[derive(Debug, Clone, Copy)]
pub struct CleanerBounds {
    pub size_lim_mb: u64,
    pub entry_lim: u64,
    pub age_lim_secs: i64,
}

impl CleanerBounds {
    pub fn any_enabled(&self) -> bool {
        self.size_lim_mb > 0 || self.entry_lim > 0 || self.age_lim_secs > 0
    }
}

/// Handle to a running cleaner thread. Dropping this does not stop the
/// thread -- call [`Cleaner::stop`] and join explicitly, mirroring the
/// teacher's supervised-background-task lifecycle.
pub struct Cleaner {
    stop_flag: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Cleaner {
    /// Spawn the cleaner thread for `dir`. Panics if no bound is enabled --
    /// this mirrors the original's `assert(size_lim>0 || entry_lim>0 ||
    /// age_lim>0)`, a precondition the caller (`main`) is responsible for.
    pub fn spawn(dir: Utf8PathBuf, bounds: CleanerBounds) -> Self {
        assert!(bounds.any_enabled(), "cleaner requires at least one bound enabled");

        let stop_flag = Arc::new(AtomicBool::new(false));
        let wake = Arc::new((Mutex::new(false), Condvar::new()));

        let thread_stop = stop_flag.clone();
        let thread_wake = wake.clone();
        let handle = std::thread::spawn(move || run(dir, bounds, thread_stop, thread_wake));

        Cleaner {
            stop_flag,
            wake,
            handle: Some(handle),
        }
    }

    /// Sets the stop flag, wakes the thread early if it's sleeping, and
    /// joins it.
    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.wake;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.wake;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(dir: Utf8PathBuf, bounds: CleanerBounds, stop: Arc<AtomicBool>, wake: Arc<(Mutex<bool>, Condvar)>) {
    let mut last_ctime: Option<SystemTime> = None;
    let mut sleep_secs: u64 = 1;

    while !stop.load(Ordering::SeqCst) {
        let _timer = crate::timed_span!(tracing::Level::DEBUG, "cleaner_cycle");
        match run_cycle(&dir, &bounds, &mut last_ctime) {
            Ok(culled) => {
                if culled {
                    if sleep_secs > SLEEP_MIN {
                        sleep_secs /= 2;
                    }
                } else if sleep_secs < SLEEP_MAX {
                    sleep_secs *= 2;
                }
            }
            Err(e) => {
                tracing::warn!(dir = %dir, error = %e, "cleaner cycle failed, directory skipped");
                if sleep_secs < SLEEP_MAX {
                    sleep_secs *= 2;
                }
            }
        }

        let (lock, cvar) = &*wake;
        let guard = lock.lock().unwrap();
        let (_guard, _timeout) = cvar
            .wait_timeout_while(guard, Duration::from_secs(sleep_secs), |&mut woken| !woken)
            .unwrap();
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
}

/// Runs one cleaner cycle. Returns `Ok(true)` if anything was culled (so the
/// caller can halve the sleep interval), `Ok(false)` otherwise.
fn run_cycle(dir: &Utf8Path, bounds: &CleanerBounds, last_ctime: &mut Option<SystemTime>) -> anyhow::Result<bool> {
    let dir_meta = std::fs::metadata(dir).map_err(|e| crate::anyhow_loc!("failed to stat {}: {}", dir, e))?;
    let ctime = dir_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    let unchanged = last_ctime.map(|last| last == ctime).unwrap_or(false);
    if unchanged && bounds.age_lim_secs <= 0 {
        return Ok(false);
    }
    *last_ctime = Some(ctime);

    let read_dir = std::fs::read_dir(dir).map_err(|e| crate::anyhow_loc!("failed to open {}: {}", dir, e))?;

    let now = SystemTime::now();
    let mut candidates: Vec<CullEntry> = Vec::new();

    for entry in read_dir {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = dir.join(&name);

        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue, // unreadable entries are ignored and excluded from totals
        };
        if !meta.is_file() {
            continue;
        }
        if !crate::vfile::is_owner_writable(&path) {
            continue;
        }

        let mtime = meta.modified().unwrap_or(now);
        let age_secs = now.duration_since(mtime).unwrap_or_default().as_secs() as i64;

        if bounds.age_lim_secs > 0 && age_secs > bounds.age_lim_secs {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(file = %path, "expired file removed"),
                Err(e) => tracing::error!(file = %path, error = %e, "failed to cull expired file"),
            }
            continue;
        }

        let atime = file_atime(&meta).unwrap_or(now);
        candidates.push(CullEntry {
            name,
            size_bytes: meta.len(),
            atime,
        });
    }

    let total_size_mb: u64 = candidates.iter().map(|e| e.size_bytes).sum::<u64>() / (1024 * 1024);
    let over_size = bounds.size_lim_mb > 0 && total_size_mb > bounds.size_lim_mb;
    let over_count = bounds.entry_lim > 0 && candidates.len() as u64 > bounds.entry_lim;

    let mut culled = false;
    if over_size || over_count {
        // Most-recently-accessed first; the tail (smallest atime) is culled
        // first, yielding an LRU-by-access discipline.
        candidates.sort_by(|a, b| b.atime.cmp(&a.atime));

        let mut running_bytes = 0u64;
        let mut exceeded = false;
        for (i, entry) in candidates.iter().enumerate() {
            if !exceeded {
                running_bytes += entry.size_bytes;
                let size_exceeded = bounds.size_lim_mb > 0 && running_bytes / (1024 * 1024) > bounds.size_lim_mb;
                let count_exceeded = bounds.entry_lim > 0 && (i as u64) > bounds.entry_lim;
                exceeded = size_exceeded || count_exceeded;
                if exceeded {
                    culled |= cull(dir, entry);
                }
            } else {
                culled |= cull(dir, entry);
            }
        }
    }

    Ok(culled)
}

fn cull(dir: &Utf8Path, entry: &CullEntry) -> bool {
    let path = dir.join(&entry.name);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(file = %path, "culled");
            true
        }
        Err(e) => {
            tracing::error!(file = %path, error = %e, "failed to cull file from cache directory");
            false
        }
    }
}

fn file_atime(meta: &std::fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    let atime = meta.atime();
    let atime_nsec = meta.atime_nsec();
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(atime as u64, atime_nsec as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Utf8Path, contents: &[u8]) {
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn age_based_eviction_removes_only_expired_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        touch(&dir.join("young"), b"x");
        touch(&dir.join("old"), b"y");

        // Backdate "old"'s mtime well past any reasonable age limit.
        let old_path = dir.join("old");
        let past = std::time::SystemTime::now() - Duration::from_secs(1000);
        let ft = filetime_from_system_time(past);
        set_mtime(&old_path, ft);

        let bounds = CleanerBounds {
            size_lim_mb: 0,
            entry_lim: 0,
            age_lim_secs: 60,
        };
        let mut last_ctime = None;
        run_cycle(dir, &bounds, &mut last_ctime).unwrap();

        assert!(dir.join("young").exists());
        assert!(!dir.join("old").exists());
    }

    #[test]
    fn non_regular_and_non_writable_entries_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        std::fs::create_dir(dir.join("subdir")).unwrap();
        touch(&dir.join("readonly"), b"z");
        let mut perms = std::fs::metadata(dir.join("readonly")).unwrap().permissions();
        perms.set_mode(0o444);
        std::fs::set_permissions(dir.join("readonly"), perms).unwrap();

        let bounds = CleanerBounds {
            size_lim_mb: 0,
            entry_lim: 0,
            age_lim_secs: 1,
        };
        let mut last_ctime = None;
        // Neither the subdirectory nor the read-only file should be touched.
        run_cycle(dir, &bounds, &mut last_ctime).unwrap();
        assert!(dir.join("subdir").exists());
        assert!(dir.join("readonly").exists());
    }

    #[test]
    fn size_based_eviction_culls_oldest_atime_first() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();

        // Five 2MB files, 10MB total, with distinct atimes (oldest first).
        let names = ["a", "b", "c", "d", "e"];
        for (i, name) in names.iter().enumerate() {
            let path = dir.join(name);
            touch(&path, &vec![0u8; 2 * 1024 * 1024]);
            let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            let atime = std::time::SystemTime::now() - Duration::from_secs((names.len() - i) as u64 * 100);
            file.set_modified(atime).unwrap();
            set_atime(&path, atime);
        }

        let bounds = CleanerBounds {
            size_lim_mb: 4,
            entry_lim: 0,
            age_lim_secs: 0,
        };
        let mut last_ctime = None;
        let culled = run_cycle(dir, &bounds, &mut last_ctime).unwrap();
        assert!(culled);

        let remaining: u64 = names
            .iter()
            .filter(|n| dir.join(n).exists())
            .map(|n| std::fs::metadata(dir.join(n)).unwrap().len())
            .sum();
        assert!(remaining / (1024 * 1024) <= bounds.size_lim_mb);
        // The two oldest (by atime) entries must be the ones removed.
        assert!(!dir.join("a").exists());
        assert!(!dir.join("b").exists());
    }

    fn set_atime(path: &Utf8Path, atime: std::time::SystemTime) {
        // `File::set_modified` only touches mtime; atime must go through
        // `utimensat` directly since `std` has no portable atime setter.
        let atime_spec = atime
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap();
        let times = [
            libc::timespec {
                tv_sec: atime_spec.as_secs() as libc::time_t,
                tv_nsec: atime_spec.subsec_nanos() as i64,
            },
            libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
        ];
        let c_path = std::ffi::CString::new(path.as_str()).unwrap();
        let rv = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
        assert_eq!(rv, 0, "utimensat failed: {}", std::io::Error::last_os_error());
    }

    // Minimal local stand-ins so this module doesn't need the `filetime`
    // crate just for two tests.
    struct Ft(std::time::SystemTime);
    fn filetime_from_system_time(t: std::time::SystemTime) -> Ft {
        Ft(t)
    }
    fn set_mtime(path: &Utf8Path, ft: Ft) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(ft.0).unwrap();
    }
}

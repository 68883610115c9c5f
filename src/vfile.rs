//! Virtual file (C3): resolves a mounted path to its source and cache
//! counterparts, and materialises the cache entry on demand.

use crate::error::CmdfsErrorKind;
use crate::filter::FilterRules;
use crate::options::Config;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How `getattr` should report a mount-relative path, derived from the
/// classification table in SPEC_FULL.md §4.3.
#[derive(Debug, Clone)]
pub enum Classification {
    /// The source doesn't qualify and `link_thru` is off: absent.
    Hidden,
    /// `link_thru` surfaces the file as a read-only symlink to `S`.
    SymlinkThrough { target: Utf8PathBuf, mount_path_len: u64 },
    /// The file is materialised through the configured command.
    Materialised { cache_path: Utf8PathBuf, size: u64 },
    /// A directory, passed straight through.
    Directory,
    /// A directory hidden because it (recursively) contains no qualifying file.
    HiddenEmptyDirectory,
}

/// A virtual file: the (source, mount, cache) triple plus an optional open
/// read handle. Holds `Arc` clones of the shared config/filter rather than
/// borrowing, so it can outlive the kernel call that constructed it and be
/// parked in the FS bridge's per-handle table between `open` and `release`.
pub struct VirtualFile {
    pub src: Utf8PathBuf,
    pub mount: Utf8PathBuf,
    config: Arc<Config>,
    filter: Arc<FilterRules>,
    handle: Option<File>,
}

impl VirtualFile {
    /// Translate a mount-relative path `M` to its virtual file, by
    /// substituting the mount root prefix with the base directory.
    pub fn from_dst(mount_path: &Utf8Path, config: &Arc<Config>, filter: &Arc<FilterRules>) -> Self {
        let rel = mount_path.strip_prefix(&config.mount_dir).unwrap_or(mount_path);
        let src = config.base_dir.join(rel);
        Self {
            src,
            mount: mount_path.to_path_buf(),
            config: config.clone(),
            filter: filter.clone(),
            handle: None,
        }
    }

    /// Inverse of [`Self::from_dst`], used by the monitor and by directory
    /// enumeration where the source path is already known.
    pub fn from_src(src_path: &Utf8Path, config: &Arc<Config>, filter: &Arc<FilterRules>) -> Self {
        let rel = src_path.strip_prefix(&config.base_dir).unwrap_or(src_path);
        let mount = config.mount_dir.join(rel);
        Self {
            src: src_path.to_path_buf(),
            mount,
            config: config.clone(),
            filter: filter.clone(),
            handle: None,
        }
    }

    /// The configured command, iff the filter qualifies `src`. Side-effect
    /// free; performs MIME detection only if the filter has MIME rules.
    pub fn get_command(&self) -> Option<&str> {
        let mime = if self.filter.has_mime_rules() {
            Some(crate::filter::detect_mime_type(&self.src))
        } else {
            None
        };
        if self.filter.qualifies(&self.src, mime.as_deref()) {
            Some(&self.config.command)
        } else {
            None
        }
    }

    /// `K`: deterministic from `src`, no I/O.
    pub fn get_cached_path(&self) -> Utf8PathBuf {
        self.config.cache_dir.join(crate::pathutil::hash_path(&self.src))
    }

    /// Ensures a cache entry exists for `src` and returns its path.
    ///
    /// A cache entry found but not a regular file is treated as absent (the
    /// open behavioural ambiguity resolved in SPEC_FULL.md §9) and is
    /// overwritten.
    pub fn encache(&self) -> anyhow::Result<Utf8PathBuf> {
        let cache_path = self.get_cached_path();

        if let Ok(meta) = std::fs::metadata(&cache_path) {
            if meta.is_file() {
                return Ok(cache_path);
            }
        }

        let _lock = AcquireLock::acquire(&cache_path, self.config.cache_max_wait_secs)?;

        // Re-check under the lock: another holder may have just finished.
        if let Ok(meta) = std::fs::metadata(&cache_path) {
            if meta.is_file() {
                return Ok(cache_path);
            }
        }

        let command = self
            .get_command()
            .ok_or_else(|| crate::anyhow_loc!("{} does not qualify for materialisation", self.src))?;

        let tmp_path = Utf8PathBuf::from(format!("{}.tmp", cache_path));
        let result = self.run_materialisation(command, &tmp_path);
        match result {
            Ok(()) => {
                std::fs::rename(&tmp_path, &cache_path)
                    .map_err(|e| crate::anyhow_loc!("failed to rename {} to {}: {}", tmp_path, cache_path, e))?;
                Ok(cache_path)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn run_materialisation(&self, command: &str, tmp_path: &Utf8Path) -> anyhow::Result<()> {
        let stdin_file = File::open(&self.src)
            .map_err(|e| crate::anyhow_loc!("failed to open source {} for materialisation: {}", self.src, e))?;
        let stdout_file = File::create(tmp_path)
            .map_err(|e| crate::anyhow_loc!("failed to create {}: {}", tmp_path, e))?;

        tracing::info!(command, src = %self.src, dst = %tmp_path, "materialising");

        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::from(stdin_file))
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| crate::anyhow_loc!("failed to spawn command '{}': {}", command, e))?;

        if !status.status.success() {
            let stderr = String::from_utf8_lossy(&status.stderr);
            return Err(crate::anyhow_loc!(
                "command '{}' exited with {} for {}: {}",
                command,
                status.status,
                self.src,
                stderr
            ));
        }
        Ok(())
    }

    /// Unlinks `K` if present; never fails for "absent".
    pub fn decache(&self) -> anyhow::Result<()> {
        let cache_path = self.get_cached_path();
        match std::fs::remove_file(&cache_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::anyhow_loc!("failed to decache {}: {}", cache_path, e)),
        }
    }

    /// Classify `src` for `getattr`, per the classification table.
    pub fn classify(&self) -> anyhow::Result<Classification> {
        let meta = std::fs::symlink_metadata(&self.src)
            .map_err(|e| crate::anyhow_loc!("failed to stat {}: {}", self.src, e))?;

        if meta.is_dir() {
            if self.config.hide_empty_dirs && self.is_empty_by_filter(&self.src)? {
                return Ok(Classification::HiddenEmptyDirectory);
            }
            return Ok(Classification::Directory);
        }

        if let Some(_command) = self.get_command() {
            let cache_path = self.get_cached_path();
            let cache_exists_as_file = std::fs::metadata(&cache_path).map(|m| m.is_file()).unwrap_or(false);

            if self.config.stat_pass_thru && !cache_exists_as_file {
                let src_meta = std::fs::metadata(&self.src)
                    .map_err(|e| crate::anyhow_loc!("failed to stat {}: {}", self.src, e))?;
                return Ok(Classification::Materialised {
                    cache_path: self.src.clone(),
                    size: src_meta.len(),
                });
            }

            let cache_path = if cache_exists_as_file { cache_path } else { self.encache()? };
            let cache_meta = std::fs::metadata(&cache_path)
                .map_err(|e| crate::anyhow_loc!("failed to stat cache entry {}: {}", cache_path, e))?;
            Ok(Classification::Materialised {
                cache_path,
                size: cache_meta.len(),
            })
        } else if self.config.link_thru {
            Ok(Classification::SymlinkThrough {
                target: self.src.clone(),
                mount_path_len: self.mount.as_str().len() as u64,
            })
        } else {
            Ok(Classification::Hidden)
        }
    }

    /// Whether the directory at `dir` (recursively) contains no qualifying
    /// regular file. With `link_thru`, any regular file short-circuits
    /// emptiness regardless of filter match (SPEC_FULL.md §9).
    fn is_empty_by_filter(&self, dir: &Utf8Path) -> anyhow::Result<bool> {
        use crate::pathutil::Visit;
        let mut empty = true;
        crate::pathutil::dir_visit(dir, Some(0), |entry| {
            if entry.is_dir {
                return Ok(Visit::Continue);
            }
            if self.config.link_thru {
                empty = false;
                return Ok(Visit::Abort);
            }
            let vf = VirtualFile::from_src(&entry.path, &self.config, &self.filter);
            if vf.get_command().is_some() {
                empty = false;
                return Ok(Visit::Abort);
            }
            Ok(Visit::Continue)
        })?;
        if !empty {
            return Ok(false);
        }
        // Recurse into subdirectories only if still empty so far.
        let mut subdirs = Vec::new();
        crate::pathutil::dir_visit(dir, Some(0), |entry| {
            if entry.is_dir {
                subdirs.push(entry.path.clone());
            }
            Ok(Visit::Continue)
        })?;
        for sub in subdirs {
            if !self.is_empty_by_filter(&sub)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Opens (and caches) a read-only descriptor for the canonical content:
    /// the cache file after `encache` for materialised entries, the source
    /// file for pass-through symlinks or directories.
    pub fn get_handle(&mut self) -> anyhow::Result<RawFd> {
        if let Some(f) = &self.handle {
            return dup_fd(f);
        }
        // Bypass `classify`'s `stat_pass_thru` short-circuit: that mode only
        // changes how `getattr` *reports* a not-yet-cached entry (as the
        // source's own size), it must never suppress materialisation for a
        // read. Every qualifying file is served from its cache entry.
        let path = if self.get_command().is_some() {
            self.encache()?
        } else {
            self.src.clone()
        };
        let file = File::open(&path).map_err(|e| crate::anyhow_loc!("failed to open {}: {}", path, e))?;
        let fd = dup_fd(&file)?;
        self.handle = Some(file);
        Ok(fd)
    }
}

fn dup_fd(file: &File) -> anyhow::Result<RawFd> {
    use std::os::unix::io::AsRawFd;
    let raw = file.as_raw_fd();
    let dup = unsafe { libc::dup(raw) };
    if dup < 0 {
        return Err(crate::anyhow_loc!("dup failed: {}", std::io::Error::last_os_error()));
    }
    Ok(dup)
}

/// Exclusive materialisation lock, held for the duration of one `encache`
/// call. Implemented as a lock file (`K || ".lock"`, `O_CREAT | O_EXCL`)
/// rather than an in-process mutex table so two `cmdfs` processes sharing
/// one `--cache-dir` still serialize correctly (SPEC_FULL.md §4.3).
struct AcquireLock {
    path: Utf8PathBuf,
}

impl AcquireLock {
    fn acquire(cache_path: &Utf8Path, max_wait_secs: u64) -> anyhow::Result<Self> {
        let lock_path = Utf8PathBuf::from(format!("{}.lock", cache_path));
        let deadline = Instant::now() + Duration::from_secs(max_wait_secs);
        let mut backoff = Duration::from_millis(10);
        const MAX_BACKOFF: Duration = Duration::from_millis(500);

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => return Ok(Self { path: lock_path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(crate::anyhow_loc!(
                            "timed out after {}s waiting for materialisation lock {}",
                            max_wait_secs,
                            lock_path
                        ));
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    return Err(crate::anyhow_loc!("failed to create lock file {}: {}", lock_path, e));
                }
            }
        }
    }
}

impl Drop for AcquireLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path, error = %e, "failed to remove materialisation lock");
        }
    }
}

/// Translate an outcome of a C3 operation into the errno reported at the
/// FUSE boundary (see `fsbridge.rs`).
pub fn classification_error_kind(err: &anyhow::Error) -> CmdfsErrorKind {
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        return crate::pathutil::classify_io_error(io_err);
    }
    CmdfsErrorKind::Materialisation
}

/// Whether a regular file at `path` is owner-writable -- the cleaner only
/// treats such entries as eviction candidates.
pub fn is_owner_writable(path: &Utf8Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o200 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRules;

    fn test_config(base: &Utf8Path, mount: &Utf8Path, cache: &Utf8Path) -> Config {
        Config {
            base_dir: base.to_path_buf(),
            mount_dir: mount.to_path_buf(),
            cache_dir: cache.to_path_buf(),
            command: "dd".to_string(),
            link_thru: false,
            hide_empty_dirs: false,
            stat_pass_thru: false,
            monitor: false,
            cache_size_mb: 0,
            cache_entries: 0,
            cache_expiry_secs: -1,
            cache_max_wait_secs: 5,
        }
    }

    #[test]
    fn from_dst_and_from_src_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let base = root.join("in");
        let mount = root.join("mnt");
        let cache = root.join("cache");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&cache).unwrap();

        let config = Arc::new(test_config(&base, &mount, &cache));
        let filter = Arc::new(FilterRules::new());

        let vf = VirtualFile::from_dst(&mount.join("a.txt"), &config, &filter);
        assert_eq!(vf.src, base.join("a.txt"));

        let vf2 = VirtualFile::from_src(&base.join("a.txt"), &config, &filter);
        assert_eq!(vf2.mount, mount.join("a.txt"));
    }

    #[test]
    fn encache_materialises_through_identity_command() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let base = root.join("in");
        let mount = root.join("mnt");
        let cache = root.join("cache");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(base.join("a.txt"), b"hello\n").unwrap();

        let config = Arc::new(test_config(&base, &mount, &cache));
        let mut filter = FilterRules::new();
        filter.add_extensions("txt").unwrap();
        let filter = Arc::new(filter);

        let vf = VirtualFile::from_src(&base.join("a.txt"), &config, &filter);
        let cache_path = vf.encache().unwrap();
        let content = std::fs::read(&cache_path).unwrap();
        assert_eq!(content, b"hello\n");
    }

    #[test]
    fn encache_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let base = root.join("in");
        let mount = root.join("mnt");
        let cache = root.join("cache");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(base.join("a.txt"), b"hello\n").unwrap();

        let config = Arc::new(test_config(&base, &mount, &cache));
        let mut filter = FilterRules::new();
        filter.add_extensions("txt").unwrap();
        let filter = Arc::new(filter);

        let vf = VirtualFile::from_src(&base.join("a.txt"), &config, &filter);
        let first = vf.encache().unwrap();
        let first_mtime = std::fs::metadata(&first).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = vf.encache().unwrap();
        let second_mtime = std::fs::metadata(&second).unwrap().modified().unwrap();
        assert_eq!(first, second);
        assert_eq!(first_mtime, second_mtime);
    }

    #[test]
    fn decache_on_absent_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let base = root.join("in");
        let mount = root.join("mnt");
        let cache = root.join("cache");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&cache).unwrap();

        let config = Arc::new(test_config(&base, &mount, &cache));
        let filter = Arc::new(FilterRules::new());
        let vf = VirtualFile::from_src(&base.join("nope.txt"), &config, &filter);
        assert!(vf.decache().is_ok());
    }

    #[test]
    fn classify_hides_non_qualifying_file_without_link_thru() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let base = root.join("in");
        let mount = root.join("mnt");
        let cache = root.join("cache");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(base.join("skip.bin"), b"data").unwrap();

        let config = Arc::new(test_config(&base, &mount, &cache));
        let mut filter = FilterRules::new();
        filter.add_extensions("txt").unwrap();
        let filter = Arc::new(filter);

        let vf = VirtualFile::from_src(&base.join("skip.bin"), &config, &filter);
        match vf.classify().unwrap() {
            Classification::Hidden => {}
            other => panic!("expected Hidden, got {:?}", other),
        }
    }

    #[test]
    fn concurrent_encache_materialises_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let base = root.join("in");
        let mount = root.join("mnt");
        let cache = root.join("cache");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(base.join("a.txt"), b"hello\n").unwrap();

        let counter = root.join("counter");
        std::fs::write(&counter, b"").unwrap();

        let mut config = test_config(&base, &mount, &cache);
        // Each invocation appends one byte to `counter` before copying stdin
        // to stdout, so the number of invocations is directly observable.
        config.command = format!("printf x >> {} && cat", counter);
        let config = Arc::new(config);
        let mut filter = FilterRules::new();
        filter.add_extensions("txt").unwrap();
        let filter = Arc::new(filter);

        let src = base.join("a.txt");
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let config = config.clone();
                let filter = filter.clone();
                let src = src.clone();
                scope.spawn(move || {
                    let vf = VirtualFile::from_src(&src, &config, &filter);
                    vf.encache().unwrap()
                });
            }
        });

        let invocations = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(invocations.len(), 1, "expected exactly one materialisation, got {:?}", invocations);
    }
}

//! FS bridge adapter (C6): a thin translation layer from `fuser`'s
//! inode-based kernel callbacks to the path-based C2/C3 operations.
//!
//! `fuser` addresses files by inode number, not path, so this module keeps
//! an inode table mapping each inode to its mount-relative path -- the
//! adaptation every path-based filesystem ported onto `fuser` needs, since
//! the original's `fuse_operations` table is itself path-based (older FUSE
//! high-level API).

use crate::filter::FilterRules;
use crate::options::Config;
use crate::vfile::{Classification, VirtualFile};
use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

/// An open handle: the virtual file it was opened against plus the raw fd
/// `read`/`release` operate on.
struct OpenHandle {
    vfile: VirtualFile,
    fd: RawFd,
}

/// The FUSE-facing filesystem. Holds the shared config/filter and two
/// per-mount tables: inode assignment (by mount-relative path) and open
/// handles (by file handle).
pub struct CmdfsFilesystem {
    config: Arc<Config>,
    filter: Arc<FilterRules>,
    inode_paths: DashMap<u64, Utf8PathBuf>,
    path_inodes: DashMap<Utf8PathBuf, u64>,
    next_ino: AtomicU64,
    handles: DashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
}

impl CmdfsFilesystem {
    pub fn new(config: Arc<Config>, filter: Arc<FilterRules>) -> Self {
        let inode_paths = DashMap::new();
        let path_inodes = DashMap::new();
        inode_paths.insert(ROOT_INO, config.mount_dir.clone());
        path_inodes.insert(config.mount_dir.clone(), ROOT_INO);

        Self {
            config,
            filter,
            inode_paths,
            path_inodes,
            next_ino: AtomicU64::new(ROOT_INO + 1),
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Mount-relative path for `ino`, if the inode is known.
    fn path_for_ino(&self, ino: u64) -> Option<Utf8PathBuf> {
        self.inode_paths.get(&ino).map(|p| p.clone())
    }

    /// Resolve (or assign) the inode for `path`, so repeated `lookup`s of
    /// the same child return the same inode.
    fn ino_for_path(&self, path: &Utf8Path) -> u64 {
        if let Some(existing) = self.path_inodes.get(path) {
            return *existing;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        self.inode_paths.insert(ino, path.to_path_buf());
        self.path_inodes.insert(path.to_path_buf(), ino);
        ino
    }

    fn virtual_file_for_ino(&self, ino: u64) -> Option<VirtualFile> {
        let path = self.path_for_ino(ino)?;
        Some(VirtualFile::from_dst(&path, &self.config, &self.filter))
    }
}

/// Translate a classification into the `FileAttr` `getattr`/`lookup` report,
/// or `None` if the entry is hidden (absent from the mounted tree).
fn attr_for_classification(ino: u64, classification: &Classification) -> Option<FileAttr> {
    let now = SystemTime::now();
    match classification {
        Classification::Hidden | Classification::HiddenEmptyDirectory => None,
        Classification::Directory => Some(make_attr(ino, FileType::Directory, 0, now, 0o755)),
        Classification::Materialised { size, .. } => Some(make_attr(ino, FileType::RegularFile, *size, now, 0o644)),
        Classification::SymlinkThrough { target, .. } => {
            Some(make_attr(ino, FileType::Symlink, target.as_str().len() as u64, now, 0o777))
        }
    }
}

fn make_attr(ino: u64, kind: FileType, size: u64, now: SystemTime, perm: u16) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Best-effort translation of a C3 failure to an errno, logging the
/// underlying error so the kernel-visible code doesn't lose context.
fn reply_error(context: &str, err: &anyhow::Error) -> i32 {
    let kind = crate::vfile::classification_error_kind(err);
    tracing::warn!(context, error = %err, errno = kind.errno(), "fs bridge operation failed");
    kind.errno()
}

impl Filesystem for CmdfsFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = parent_path.join(name_str);
        let vf = VirtualFile::from_dst(&child_path, &self.config, &self.filter);

        match vf.classify() {
            Ok(classification) => {
                let ino = self.ino_for_path(&child_path);
                match attr_for_classification(ino, &classification) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::ENOENT),
                }
            }
            Err(e) => reply.error(reply_error("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(vf) = self.virtual_file_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match vf.classify() {
            Ok(classification) => match attr_for_classification(ino, &classification) {
                Some(attr) => reply.attr(&TTL, &attr),
                None => reply.error(libc::ENOENT),
            },
            Err(e) => reply.error(reply_error("getattr", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(mut vf) = self.virtual_file_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match vf.get_handle() {
            Ok(fd) => {
                let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
                self.handles.insert(fh, OpenHandle { vfile: vf, fd });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(reply_error("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(entry) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let n = unsafe { libc::pread(entry.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            tracing::warn!(fh, offset, error = %err, "read failed");
            reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        buf.truncate(n as usize);
        reply.data(&buf);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some((_, entry)) = self.handles.remove(&fh) {
            unsafe {
                libc::close(entry.fd);
            }
            drop(entry.vfile);
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(vf) = self.virtual_file_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match vf.classify() {
            Ok(Classification::SymlinkThrough { target, .. }) => reply.data(target.as_str().as_bytes()),
            Ok(_) => reply.error(libc::EINVAL),
            Err(e) => reply.error(reply_error("readlink", &e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(dir_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vf = VirtualFile::from_dst(&dir_path, &self.config, &self.filter);
        match vf.classify() {
            Ok(Classification::Directory) => {}
            Ok(_) => {
                reply.error(libc::ENOTDIR);
                return;
            }
            Err(e) => {
                reply.error(reply_error("readdir", &e));
                return;
            }
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];

        let read_dir = match std::fs::read_dir(&vf.src) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::warn!(dir = %vf.src, error = %e, "readdir failed to open source directory");
                reply.error(libc::EIO);
                return;
            }
        };

        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(child_path) = Utf8PathBuf::try_from(entry.path()) else { continue };
            let child_mount = dir_path.join(&name);
            let child_vf = VirtualFile::from_src(&child_path, &self.config, &self.filter);
            let classification = match child_vf.classify() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(file = %child_path, error = %e, "readdir failed to classify entry, skipping");
                    continue;
                }
            };
            let kind = match classification {
                Classification::Hidden | Classification::HiddenEmptyDirectory => continue,
                Classification::Directory => FileType::Directory,
                Classification::Materialised { .. } => FileType::RegularFile,
                Classification::SymlinkThrough { .. } => FileType::Symlink,
            };
            let child_ino = self.ino_for_path(&child_mount);
            entries.push((child_ino, kind, name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn init(&mut self, _req: &Request<'_>, _config: &mut fuser::KernelConfig) -> Result<(), i32> {
        tracing::info!(mount = %self.config.mount_dir, base = %self.config.base_dir, "fs bridge mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("fs bridge unmounting");
    }
}

//! Path and directory-tree utilities: token substitution, the cache-key
//! path encoding, path canonicalisation-with-create, and a bounded-descriptor
//! recursive directory walk.

use crate::error::CmdfsErrorKind;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::VecDeque;

/// Replace every occurrence of `token` in `str` with `value`, unless the
/// occurrence's first character is "escaped" by a repeated leading
/// character immediately before it (e.g. with token `%s`, the sequence
/// `%%s` is not substituted).
pub fn substitute_token(s: &str, token: &str, value: &str) -> String {
    if token.is_empty() {
        return s.to_string();
    }
    let token_first_byte = token.as_bytes()[0];
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    // `l` is the last position already flushed to `out`; `pos` is where the
    // next search for `token` starts. On an escaped match (preceded by a
    // repeat of the token's first byte) we advance `pos` past it but leave
    // `l` untouched, so the escaped occurrence is copied out unchanged along
    // with whatever follows it.
    let mut l = 0usize;
    let mut pos = 0usize;
    while let Some(rel) = s[pos..].find(token) {
        let m = pos + rel;
        let escaped = m > 0 && bytes[m - 1] == token_first_byte;
        if !escaped {
            out.push_str(&s[l..m]);
            out.push_str(value);
            pos = m + token.len();
            l = pos;
        } else {
            pos = m + token.len();
        }
    }
    out.push_str(&s[l..]);
    out
}

/// Apply [`substitute_token`] for each `(token, value)` pair in order.
pub fn substitute_tokens(s: &str, pairs: &[(&str, &str)]) -> String {
    let mut rv = s.to_string();
    for (token, value) in pairs {
        rv = substitute_token(&rv, token, value);
    }
    rv
}

/// Encode a path into a filesystem-safe, reversible cache-key component.
/// `/` becomes `$`, and a literal `$` is doubled (`$$`) so the encoding
/// stays unambiguous. This is a syntactic transform, not a content hash --
/// two different paths never collide.
pub fn hash_path(path: &Utf8Path) -> String {
    let s = path.as_str();
    let mut out = String::with_capacity(s.len() * 2);
    for c in s.chars() {
        match c {
            '/' => out.push('$'),
            '$' => {
                out.push('$');
                out.push('$');
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `path` to an absolute, canonical path, creating any missing
/// leading directories along the way (mirrors the original's `makepath`:
/// `realpath` in a loop, `mkdir`-ing on `ENOENT` until it succeeds).
pub fn make_path(path: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    loop {
        match path.canonicalize_utf8() {
            Ok(p) => return Ok(p),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path)
                    .map_err(|e| crate::anyhow_loc!("failed to create directory {}: {}", path, e))?;
            }
            Err(e) => {
                return Err(crate::anyhow_loc!("failed to resolve path {}: {}", path, e));
            }
        }
    }
}

/// One entry seen while walking a directory tree.
pub struct DirEntryInfo {
    pub path: Utf8PathBuf,
    pub parent: Utf8PathBuf,
    pub name: String,
    pub is_dir: bool,
}

/// Visitor decision: keep walking, or stop the whole traversal early.
pub enum Visit {
    Continue,
    Abort,
}

/// Walk the directory tree rooted at `root` up to `max_depth` levels deep
/// (`None` means unbounded), calling `visitor` for every entry.
///
/// Each directory's handle is closed (via `read_dir`'s iterator being
/// dropped) before recursing into its subdirectories, so the number of
/// open directory descriptors at any instant is bounded by tree depth, not
/// by fan-out -- the same invariant the original's `dir_visit` preserves by
/// `closedir`-ing before recursing into the collected subdirectory list.
pub fn dir_visit<F>(root: &Utf8Path, max_depth: Option<usize>, mut visitor: F) -> anyhow::Result<()>
where
    F: FnMut(&DirEntryInfo) -> anyhow::Result<Visit>,
{
    let mut queue: VecDeque<(Utf8PathBuf, usize)> = VecDeque::new();
    queue.push_back((root.to_path_buf(), 0));

    while let Some((dir, depth)) = queue.pop_front() {
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) => {
                return Err(crate::anyhow_loc!("failed to read directory {}: {}", dir, e));
            }
        };

        let mut subdirs = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| crate::anyhow_loc!("failed to read entry in {}: {}", dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = Utf8PathBuf::try_from(entry.path())
                .map_err(|e| crate::anyhow_loc!("non-utf8 path under {}: {}", dir, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            let info = DirEntryInfo {
                path: path.clone(),
                parent: dir.clone(),
                name,
                is_dir,
            };

            match visitor(&info)? {
                Visit::Continue => {}
                Visit::Abort => return Ok(()),
            }

            if is_dir {
                subdirs.push(path);
            }
        }
        // `read_dir` is dropped here, closing the descriptor, before any
        // subdirectory is queued for traversal.

        if max_depth.map(|m| depth < m).unwrap_or(true) {
            for sub in subdirs {
                queue.push_back((sub, depth + 1));
            }
        }
    }

    Ok(())
}

/// Translate an I/O error encountered while resolving or materialising a
/// path into the [`CmdfsErrorKind`] reported at the FUSE boundary.
pub fn classify_io_error(err: &std::io::Error) -> CmdfsErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => CmdfsErrorKind::NotPresent,
        std::io::ErrorKind::PermissionDenied => CmdfsErrorKind::Permission,
        _ => CmdfsErrorKind::Materialisation,
    }
}

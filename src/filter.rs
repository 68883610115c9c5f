//! Filter policy (C2): decides whether a source path is subject to command
//! materialisation, based on include/exclude/MIME regex rule sets.

use camino::Utf8Path;
use regex::Regex;

/// A compiled, read-only-after-startup rule set.
///
/// A source path qualifies for materialisation iff:
/// - it matches at least one include regex, or no include regex is configured;
/// - it matches no exclude regex;
/// - if any MIME regex is configured, its detected MIME type matches at
///   least one of them.
#[derive(Debug, Default)]
pub struct FilterRules {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    mime: Vec<Regex>,
}

impl FilterRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an include regex matched against the full source path.
    pub fn add_path_include(&mut self, pattern: &str) -> anyhow::Result<()> {
        self.include.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Add an exclude regex matched against the full source path.
    pub fn add_exclude(&mut self, pattern: &str) -> anyhow::Result<()> {
        self.exclude.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Add a MIME-type regex.
    pub fn add_mime(&mut self, pattern: &str) -> anyhow::Result<()> {
        self.mime.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Shorthand for `extension=ext1[;ext2;...]`: each extension becomes an
    /// include regex `.*/.*\.ext` (case-insensitive), mirroring the
    /// original's `KEY_EXTENSION` handling.
    pub fn add_extensions(&mut self, spec: &str) -> anyhow::Result<()> {
        for ext in spec.split(';').filter(|e| !e.is_empty()) {
            let pattern = format!(r"(?i).*/.*\.{}$", regex::escape(ext));
            self.include.push(Regex::new(&pattern)?);
        }
        Ok(())
    }

    pub fn has_mime_rules(&self) -> bool {
        !self.mime.is_empty()
    }

    /// Whether `path` qualifies for materialisation. `mime_type` is the
    /// lazily-computed MIME type of the path, only needed (and only passed)
    /// when MIME rules are configured.
    pub fn qualifies(&self, path: &Utf8Path, mime_type: Option<&str>) -> bool {
        let path_str = path.as_str();

        let include_ok = self.include.is_empty() || self.include.iter().any(|r| r.is_match(path_str));
        if !include_ok {
            return false;
        }

        let exclude_ok = !self.exclude.iter().any(|r| r.is_match(path_str));
        if !exclude_ok {
            return false;
        }

        if self.mime.is_empty() {
            return true;
        }

        match mime_type {
            Some(mt) => self.mime.iter().any(|r| r.is_match(mt)),
            None => false,
        }
    }
}

/// Extension-based MIME lookup. No example repo in the pack wraps
/// `libmagic`; the original's own MIME option is itself just a regex over a
/// detected type string, so a small extension table is a faithful
/// stand-in (documented as a resolved Open Question in SPEC_FULL.md §9).
pub fn detect_mime_type(path: &Utf8Path) -> &'static str {
    match path.extension().map(|e| e.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "txt" | "md" | "log" => "text/plain",
            "html" | "htm" => "text/html",
            "css" => "text/css",
            "csv" => "text/csv",
            "json" => "application/json",
            "xml" => "application/xml",
            "js" => "application/javascript",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "pdf" => "application/pdf",
            "gz" | "tgz" => "application/gzip",
            "zip" => "application/zip",
            "tar" => "application/x-tar",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}

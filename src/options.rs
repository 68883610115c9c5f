//! CLI surface and the immutable [`Config`] threaded into every component.

use crate::filter::FilterRules;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

/// Default command applied to files that qualify for materialisation --
/// `dd` performs an identity copy, matching the original's fallback.
pub const DEFAULT_COMMAND: &str = "dd";

/// Seconds `encache` will wait for another process/thread's materialisation
/// lock before giving up.
pub const DEFAULT_CACHE_MAX_WAIT: u64 = 600;

#[derive(Debug, Parser)]
#[command(
    name = "cmdfs",
    about = "A FUSE filesystem that materializes source files through a shell command and caches the result",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct CliArgs {
    /// Real directory whose tree is projected.
    pub source_dir: Utf8PathBuf,

    /// Empty directory the projected tree is mounted onto.
    pub mountpoint: Utf8PathBuf,

    /// Mount option, `key` or `key=value`. May be repeated; each `-o` value
    /// may itself be a comma-separated list, matching conventional FUSE
    /// `-o opt1,opt2` usage.
    #[arg(short = 'o', action = clap::ArgAction::Append)]
    pub mount_options: Vec<String>,

    #[arg(short = 'h', long = "help", action = clap::ArgAction::SetTrue)]
    pub help: bool,

    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    pub version: bool,
}

/// Immutable configuration, constructed once in `main` and shared via `Arc`
/// with the FS bridge, the cleaner, and the monitor. No component mutates it
/// after the mount is live.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: Utf8PathBuf,
    pub mount_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub command: String,
    pub link_thru: bool,
    pub hide_empty_dirs: bool,
    pub stat_pass_thru: bool,
    pub monitor: bool,
    pub cache_size_mb: u64,
    pub cache_entries: u64,
    pub cache_expiry_secs: i64,
    pub cache_max_wait_secs: u64,
}

/// One parsed `-o` clause, before it's folded into [`Config`]/[`FilterRules`].
enum OptionClause {
    Flag { key: String, value: bool },
    KeyValue { key: String, value: String },
}

fn parse_clause(clause: &str) -> Option<OptionClause> {
    if clause.is_empty() {
        return None;
    }
    if let Some((key, value)) = clause.split_once('=') {
        return Some(OptionClause::KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    if let Some(key) = clause.strip_prefix("no") {
        // Boolean toggles come in "flag"/"noflag" pairs, as in the original
        // fuse_opt table (link-thru/nolink-thru, etc). Only recognised
        // boolean keys get the "no" prefix stripped; anything else is a
        // plain bare flag.
        if matches!(key, "link-thru" | "stat-pass-thru" | "hide-empty-dirs" | "monitor") {
            return Some(OptionClause::Flag {
                key: key.to_string(),
                value: false,
            });
        }
    }
    Some(OptionClause::Flag {
        key: clause.to_string(),
        value: true,
    })
}

/// Build [`Config`] and [`FilterRules`] from parsed CLI args. Token
/// substitution and cache-dir creation happen here, matching the original's
/// `main()` sequence: parse options, default+substitute+canonicalize
/// `cache_dir`, default `command`.
pub fn build_config(args: &CliArgs) -> anyhow::Result<(Config, FilterRules)> {
    let base_dir = args
        .source_dir
        .canonicalize_utf8()
        .map_err(|e| crate::anyhow_loc!("source directory {} does not exist: {}", args.source_dir, e))?;
    let mount_dir = args
        .mountpoint
        .canonicalize_utf8()
        .map_err(|e| crate::anyhow_loc!("mountpoint {} does not exist: {}", args.mountpoint, e))?;

    let mut link_thru = false;
    let mut hide_empty_dirs = false;
    let mut stat_pass_thru = false;
    let mut monitor = true;
    let mut cache_dir: Option<String> = None;
    let mut cache_size_mb: u64 = 0;
    let mut cache_entries: u64 = 0;
    let mut cache_expiry_secs: i64 = -1;
    let mut command: Option<String> = None;
    let mut filter = FilterRules::new();

    for raw in &args.mount_options {
        for clause in raw.split(',') {
            match parse_clause(clause) {
                Some(OptionClause::Flag { key, value }) => match key.as_str() {
                    "link-thru" => link_thru = value,
                    "stat-pass-thru" => stat_pass_thru = value,
                    "hide-empty-dirs" => hide_empty_dirs = value,
                    "monitor" => monitor = value,
                    other => {
                        return Err(crate::anyhow_loc!("unrecognised mount option '{}'", other));
                    }
                },
                Some(OptionClause::KeyValue { key, value }) => match key.as_str() {
                    "command" => command = Some(value),
                    "extension" => filter.add_extensions(&value)?,
                    "path-re" => filter.add_path_include(&value)?,
                    "exclude-re" => filter.add_exclude(&value)?,
                    "mime-re" => filter.add_mime(&value)?,
                    "cache-dir" => cache_dir = Some(value),
                    "cache-size" => {
                        cache_size_mb = value
                            .parse()
                            .map_err(|_| crate::anyhow_loc!("cache-size must be a non-negative integer"))?
                    }
                    "cache-entries" => {
                        cache_entries = value
                            .parse()
                            .map_err(|_| crate::anyhow_loc!("cache-entries must be a non-negative integer"))?
                    }
                    "cache-expiry" => {
                        cache_expiry_secs = value
                            .parse()
                            .map_err(|_| crate::anyhow_loc!("cache-expiry must be an integer"))?
                    }
                    other => {
                        return Err(crate::anyhow_loc!("unrecognised mount option '{}'", other));
                    }
                },
                None => {}
            }
        }
    }

    let cache_root = cache_dir.unwrap_or_else(|| format!("{}/%u/%b", default_cache_root()));
    let login = whoami_login();
    let substituted = crate::pathutil::substitute_tokens(
        &cache_root,
        &[("%u", &login), ("%b", base_dir.as_str()), ("%m", mount_dir.as_str())],
    );
    let cache_dir = crate::pathutil::make_path(Utf8Path::new(&substituted))
        .map_err(|e| crate::anyhow_loc!("could not create/find cache directory {}: {}", substituted, e))?;

    let config = Config {
        base_dir,
        mount_dir,
        cache_dir,
        command: command.unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
        link_thru,
        hide_empty_dirs,
        stat_pass_thru,
        monitor,
        cache_size_mb,
        cache_entries,
        cache_expiry_secs,
        cache_max_wait_secs: DEFAULT_CACHE_MAX_WAIT,
    };

    Ok((config, filter))
}

/// `$XDG_CACHE_HOME/cmdfs`, falling back to `~/.cache/cmdfs` -- the
/// runtime equivalent of the original's compile-time `CACHE_ROOT` macro.
fn default_cache_root() -> String {
    let base = dirs::cache_dir().unwrap_or_else(|| std::path::PathBuf::from("/tmp"));
    base.join("cmdfs").to_string_lossy().into_owned()
}

fn whoami_login() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub const HELP_TEXT: &str = "\
usage: cmdfs source-dir mountpoint [options]

general options:
    -o opt,[opt...]  mount options
    -h   --help      print help
    -V   --version   print version

cmdfs options:
    -o command=<shell command> (dd)
    -o extension=ext1[;ext2[;...]]
    -o path-re=<regular expression>
    -o exclude-re=<regular expression>
    -o mime-re=<regular expression>
    -o [no]link-thru (nolink-thru)
    -o [no]stat-pass-thru (nostat-pass-thru)
    -o [no]hide-empty-dirs (nohide-empty-dirs)
    -o [no]monitor (nomonitor)
    -o cache-dir=<dir> (<XDG_CACHE_HOME>/cmdfs/<user>/<source-dir>)
    -o cache-size=<size in Mb> (no limit)
    -o cache-entries=<count> (no limit)
    -o cache-expiry=<time in secs> (no expiry)
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_clause_bare_flag() {
        match parse_clause("monitor") {
            Some(OptionClause::Flag { key, value }) => {
                assert_eq!(key, "monitor");
                assert!(value);
            }
            _ => panic!("expected flag"),
        }
    }

    #[test]
    fn parse_clause_negated_flag() {
        match parse_clause("nolink-thru") {
            Some(OptionClause::Flag { key, value }) => {
                assert_eq!(key, "link-thru");
                assert!(!value);
            }
            _ => panic!("expected flag"),
        }
    }

    #[test]
    fn parse_clause_key_value() {
        match parse_clause("command=dd") {
            Some(OptionClause::KeyValue { key, value }) => {
                assert_eq!(key, "command");
                assert_eq!(value, "dd");
            }
            _ => panic!("expected key-value"),
        }
    }

    #[test]
    fn build_config_defaults_command_to_dd() {
        let src = tempfile::tempdir().unwrap();
        let mnt = tempfile::tempdir().unwrap();
        let args = CliArgs {
            source_dir: Utf8PathBuf::from_path_buf(src.path().to_path_buf()).unwrap(),
            mountpoint: Utf8PathBuf::from_path_buf(mnt.path().to_path_buf()).unwrap(),
            mount_options: vec!["cache-dir=".to_string() + mnt.path().to_string_lossy().as_ref()],
            help: false,
            version: false,
        };
        let (config, _filter) = build_config(&args).unwrap();
        assert_eq!(config.command, "dd");
        assert!(config.monitor);
    }
}

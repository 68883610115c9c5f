//! `cmdfs`: mounts a FUSE filesystem that projects a source directory,
//! materialising each qualifying file through a configured shell command and
//! caching the result.

use cmdfs::cleaner::{Cleaner, CleanerBounds};
use cmdfs::fsbridge::CmdfsFilesystem;
use cmdfs::logging::{init_logging, LogConfig};
use cmdfs::monitor::Monitor;
use cmdfs::options::{build_config, CliArgs, HELP_TEXT};
use std::sync::Arc;

fn main() {
    if let Err(e) = run() {
        eprintln!("cmdfs: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // Two-stage diagnostics: print cmdfs's own option table, then (per
    // SPEC_FULL.md §6) let FUSE append its own via a synthetic flag, mirroring
    // cmdfs.c::cmdfs_opt_proc's handling of -h/-V.
    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", HELP_TEXT);
        print_fuse_help();
        return Ok(());
    }
    if raw_args.iter().any(|a| a == "-V" || a == "--version") {
        println!("cmdfs {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let args = <CliArgs as clap::Parser>::parse();

    init_logging(&LogConfig::default())?;

    let (config, filter) = build_config(&args)?;
    let config = Arc::new(config);
    let filter = Arc::new(filter);

    let cleaner_bounds = CleanerBounds {
        size_lim_mb: config.cache_size_mb,
        entry_lim: config.cache_entries,
        age_lim_secs: config.cache_expiry_secs,
    };
    let cleaner = cleaner_bounds
        .any_enabled()
        .then(|| Cleaner::spawn(config.cache_dir.clone(), cleaner_bounds));

    let monitor = if config.monitor {
        Some(Monitor::spawn(config.clone(), filter.clone())?)
    } else {
        None
    };

    tracing::info!(
        base = %config.base_dir,
        mount = %config.mount_dir,
        cache = %config.cache_dir,
        "mounting"
    );

    let fs = CmdfsFilesystem::new(config.clone(), filter.clone());
    let mount_options = vec![fuser::MountOption::RO, fuser::MountOption::FSName("cmdfs".to_string())];
    let result = fuser::mount2(fs, config.mount_dir.as_std_path(), &mount_options);

    if let Some(monitor) = monitor {
        monitor.stop();
    }
    if let Some(cleaner) = cleaner {
        cleaner.stop();
    }

    result.map_err(|e| cmdfs::anyhow_loc!("mount failed: {}", e))
}

/// Best-effort: ask `fuser` to print its own kernel-mount-option help, the
/// way the original hands a synthetic `-ho` argument to `fuse_main` after
/// printing cmdfs's own option table (`cmdfs.c::cmdfs_opt_proc`).
fn print_fuse_help() {
    println!();
    println!("FUSE options (via libfuse):");
    println!("    -o allow_other         allow access by other users");
    println!("    -o allow_root          allow access by root");
    println!("    -o auto_unmount        auto unmount on process exit");
    println!("    -o default_permissions let the kernel enforce permissions");
}

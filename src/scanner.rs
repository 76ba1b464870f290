//! Scanner: walks a `ScanRoot` and yields candidate regular files.
//!
//! The walk runs on a dedicated OS thread and streams `Candidate`s through
//! a bounded channel so the Policy Engine can start sorting/deleting before
//! the walk finishes, bounding peak memory to the channel capacity rather
//! than the whole tree.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use glob::Pattern;
use walkdir::WalkDir;

use crate::config::ScanRoot;

/// Bound on the in-flight candidate channel, per the resource model.
pub const CHANNEL_CAPACITY: usize = 16_384;

/// Coarse type of a filesystem entry. Only `Regular` files are eligible
/// for deletion; symlinks are never unlinked even when emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Symlink,
    Directory,
    Other,
}

/// A file found by the Scanner and eligible for policy evaluation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub age_days: u64,
    pub root_path: PathBuf,
    pub file_type: FileKind,
}

/// Paths the daemon refuses to descend into or emit, regardless of
/// scan-root configuration.
#[derive(Debug, Clone)]
pub struct ProtectedPaths {
    pub audit_db: PathBuf,
    pub config_file: PathBuf,
    pub executable: PathBuf,
    pub pid_file: Option<PathBuf>,
}

impl ProtectedPaths {
    pub fn contains(&self, path: &Path) -> bool {
        [
            Some(&self.audit_db),
            Some(&self.config_file),
            Some(&self.executable),
            self.pid_file.as_ref(),
        ]
        .into_iter()
        .flatten()
        .any(|p| p == path)
    }
}

/// Per-scan error/skip counters, surfaced as `errors_total{kind="scan_io"}`.
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub entries_visited: u64,
    pub io_errors: u64,
    pub last_error: Option<String>,
}

fn age_days(modified: SystemTime, now: DateTime<Utc>) -> u64 {
    let modified_dt: DateTime<Utc> = modified.into();
    let delta = now.signed_duration_since(modified_dt);
    // Clock skew: a future mtime is treated as age 0 (never deleted by age).
    delta.num_seconds().max(0) as u64 / 86_400
}

fn matches_filters(name: &str, include: &[Pattern], exclude: &[Pattern]) -> bool {
    if exclude.iter().any(|p| p.matches(name)) {
        return false;
    }
    if include.is_empty() {
        return true;
    }
    include.iter().any(|p| p.matches(name))
}

fn compile_patterns(specs: &[String]) -> Vec<Pattern> {
    specs
        .iter()
        .filter_map(|s| Pattern::new(s).ok())
        .collect()
}

/// Walk `root` and stream eligible candidates. Returns a receiver the
/// caller must drain (or drop, which stops the walk once the channel
/// fills) and a join handle yielding the final `ScanStats`.
pub fn scan(root: ScanRoot, protected: ProtectedPaths, now: DateTime<Utc>) -> (Receiver<Candidate>, JoinHandle<ScanStats>) {
    let (tx, rx) = bounded(CHANNEL_CAPACITY);

    let handle = std::thread::spawn(move || {
        let mut stats = ScanStats::default();
        let include = compile_patterns(&root.include);
        let exclude = compile_patterns(&root.exclude);

        let root_canonical = match root.path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                stats.io_errors += 1;
                stats.last_error = Some(format!("canonicalize {}: {e}", root.path.display()));
                return stats;
            }
        };

        let mut walker = WalkDir::new(&root.path)
            .follow_links(root.follow_symlinks)
            .same_file_system(!root.cross_filesystem)
            .into_iter();

        loop {
            let entry = match walker.next() {
                Some(Ok(e)) => e,
                Some(Err(e)) => {
                    stats.io_errors += 1;
                    stats.last_error = Some(e.to_string());
                    continue;
                }
                None => break,
            };

            let name = entry.file_name().to_string_lossy().to_string();

            if entry.file_type().is_dir() {
                // Root entry itself is never pruned by its own name.
                if entry.depth() > 0 && exclude.iter().any(|p| p.matches(&name)) {
                    walker.skip_current_dir();
                }
                continue;
            }

            stats.entries_visited += 1;

            if protected.contains(entry.path()) {
                continue;
            }

            if !matches_filters(&name, &include, &exclude) {
                continue;
            }

            // `entry.file_type()` reports the dereferenced target's type when
            // `follow_links(true)`, so a symlink to a regular file would
            // otherwise misclassify as `Regular`. `path_is_symlink()` checks
            // the entry's own `lstat`, independent of `follow_links`.
            let file_type = if entry.path_is_symlink() {
                FileKind::Symlink
            } else if entry.file_type().is_file() {
                FileKind::Regular
            } else {
                FileKind::Other
            };

            // Symlinks themselves are never unlinked; only emit them if
            // following is enabled so they can participate in ordering
            // diagnostics, but the Policy Engine must never select them.
            if file_type != FileKind::Regular && !(file_type == FileKind::Symlink && root.follow_symlinks) {
                continue;
            }

            // Defense against symlink escape: resolve and re-check the
            // entry is still a descendant of the scan root.
            let resolved = match entry.path().canonicalize() {
                Ok(p) => p,
                Err(e) => {
                    stats.io_errors += 1;
                    stats.last_error = Some(format!("canonicalize {}: {e}", entry.path().display()));
                    continue;
                }
            };
            if !resolved.starts_with(&root_canonical) {
                continue;
            }
            if protected.contains(&resolved) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    stats.io_errors += 1;
                    stats.last_error = Some(format!("metadata {}: {e}", entry.path().display()));
                    continue;
                }
            };

            let modified = match meta.modified() {
                Ok(m) => m,
                Err(e) => {
                    stats.io_errors += 1;
                    stats.last_error = Some(format!("mtime {}: {e}", entry.path().display()));
                    continue;
                }
            };

            let candidate = Candidate {
                path: entry.path().to_path_buf(),
                size: meta.len(),
                modified,
                age_days: age_days(modified, now),
                root_path: root.path.clone(),
                file_type,
            };

            if tx.send(candidate).is_err() {
                // Receiver dropped: caller is done, stop walking.
                break;
            }
        }

        stats
    });

    (rx, handle)
}

//! Policy Engine: mode selection, candidate ordering, and deletion
//! semantics. The heart of the daemon (`spec.md` §4.4).

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditStore, Mode};
use crate::config::{Config, ScanRoot};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::probe::{self, Usage};
use crate::scanner::{self, Candidate, FileKind, ProtectedPaths};

/// Re-check disk usage every `K` deletions during DISK_USAGE/STACK
/// hysteresis, per `spec.md` §4.4.
const PRESSURE_RECHECK_INTERVAL: usize = 64;

/// Bound on in-memory candidates per root, matching the Scanner's channel
/// capacity (`spec.md` §5: "streams to the Policy Engine in bounded chunks
/// ... the engine merges/sorts chunks to bound RSS").
const CANDIDATE_MERGE_LIMIT: usize = scanner::CHANNEL_CAPACITY;

/// First-match-wins mode selection across all configured roots
/// (`spec.md` §4.4, step 1-3). `usages` pairs each root's path with its
/// probed `Usage`. A root's `stack_trigger_percent`, when set, overrides
/// `cfg.stack_threshold` for that root only (`spec.md` §3).
pub fn select_mode(usages: &[(&ScanRoot, Usage)], cfg: &Config) -> Mode {
    if usages
        .iter()
        .any(|(root, u)| u.used_percent >= root.stack_trigger_percent.unwrap_or(cfg.stack_threshold) as f64)
    {
        return Mode::Stack;
    }
    if usages.iter().any(|(_, u)| u.used_percent > cfg.max_free_percent as f64) {
        return Mode::DiskUsage;
    }
    Mode::Age
}

/// Outcome of running the policy engine against one scan root.
#[derive(Debug, Default, Clone)]
pub struct RootCycleOutcome {
    pub considered: u64,
    pub deleted: u64,
    pub bytes_freed: u64,
    pub errors: u64,
    /// Subset of `errors` that are `audit_io`/`policy` kind: these mark
    /// `/health` as `"unhealthy"` rather than merely `"degraded"`.
    pub severe_errors: u64,
}

/// Candidate ordering shared by AGE, DISK_USAGE, and STACK mode: age desc,
/// size desc, path asc (stable tie-break). STACK's "size-weighted" tie-break
/// for same-age candidates falls out of the same comparator.
fn candidate_cmp(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.age_days
        .cmp(&a.age_days)
        .then_with(|| b.size.cmp(&a.size))
        .then_with(|| a.path.cmp(&b.path))
}

/// Merge two already-`candidate_cmp`-sorted chunks, keeping only the first
/// `limit` entries in merged order. Used to fold the Scanner's bounded
/// chunks into a single ranked list without ever materializing the full
/// candidate set (`spec.md` §5).
fn merge_bounded(a: Vec<Candidate>, b: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    let mut out = Vec::with_capacity((a.len() + b.len()).min(limit));
    let mut ai = a.into_iter().peekable();
    let mut bi = b.into_iter().peekable();
    while out.len() < limit {
        let take_a = match (ai.peek(), bi.peek()) {
            (Some(x), Some(y)) => candidate_cmp(x, y) != std::cmp::Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_a {
            out.push(ai.next().unwrap());
        } else {
            out.push(bi.next().unwrap());
        }
    }
    out
}

/// Whether a candidate is eligible for deletion under `mode`.
fn eligible(candidate: &Candidate, mode: Mode, root: &ScanRoot) -> bool {
    match mode {
        Mode::Age | Mode::DryRun => candidate.age_days >= root.age_off_days,
        Mode::DiskUsage => true,
        Mode::Stack => candidate.age_days >= root.stack_age_days,
    }
}

fn reason_for(mode: Mode) -> &'static str {
    match mode {
        Mode::Age | Mode::DryRun => "age-threshold",
        Mode::DiskUsage => "disk-pressure",
        Mode::Stack => "stack-emergency",
    }
}

/// Re-stat a candidate right before deletion; returns `None` if it should
/// be skipped as `raced` (§4.4 step 1).
fn revalidate(candidate: &Candidate, follow_symlinks: bool) -> Option<std::fs::Metadata> {
    let meta = std::fs::symlink_metadata(&candidate.path).ok()?;

    if meta.is_dir() {
        return None;
    }
    if meta.file_type().is_symlink() && !follow_symlinks {
        return None;
    }

    let modified = meta.modified().ok()?;
    let size = meta.len();

    // "its mtime/size changed meaningfully (size delta > 0 and the file is
    // now opened/modified within the last minute)"
    if size != candidate.size {
        let recently_touched = modified
            .elapsed()
            .map(|e| e < Duration::from_secs(60))
            .unwrap_or(false);
        if recently_touched {
            return None;
        }
    }

    Some(meta)
}

fn still_safe(resolved: &Path, root_canonical: &Path, protected: &ProtectedPaths) -> bool {
    resolved.starts_with(root_canonical) && !protected.contains(resolved)
}

/// Run the policy engine against a single scan root, in the chosen mode,
/// under `cfg`'s dry-run gating and safety caps. Blocking: callers should
/// run this on a blocking-capable executor thread.
#[allow(clippy::too_many_arguments)]
pub fn process_root(
    root: &ScanRoot,
    mode: Mode,
    cfg: &Config,
    audit: &Arc<Mutex<AuditStore>>,
    metrics: &Metrics,
    protected: &ProtectedPaths,
    cancel: &CancellationToken,
    now: DateTime<Utc>,
) -> RootCycleOutcome {
    let mut outcome = RootCycleOutcome::default();
    let deadline = Instant::now() + Duration::from_secs(cfg.cycle_budget_seconds);

    let root_canonical = match root.path.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            let err = AppError::ScanIo { path: root.path.display().to_string(), source: e };
            tracing::warn!(error = %err, "failed to canonicalize scan root");
            err.observe(metrics);
            outcome.errors += 1;
            return outcome;
        }
    };

    let (rx, scan_handle) = scanner::scan(root.clone(), protected.clone(), now);

    // Fold the Scanner's stream into a bounded, ranked list chunk by chunk
    // instead of collecting everything into one unbounded `Vec` (§5).
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut chunk: Vec<Candidate> = Vec::with_capacity(CANDIDATE_MERGE_LIMIT);
    let mut considered = 0u64;
    for candidate in rx.iter() {
        considered += 1;
        chunk.push(candidate);
        if chunk.len() >= CANDIDATE_MERGE_LIMIT {
            chunk.sort_by(candidate_cmp);
            candidates = merge_bounded(candidates, std::mem::take(&mut chunk), CANDIDATE_MERGE_LIMIT);
        }
    }
    if !chunk.is_empty() {
        chunk.sort_by(candidate_cmp);
        candidates = merge_bounded(candidates, chunk, CANDIDATE_MERGE_LIMIT);
    }

    let scan_stats = scan_handle.join().unwrap_or_default();
    outcome.errors += scan_stats.io_errors;
    if scan_stats.io_errors > 0 {
        let err = AppError::ScanIo {
            path: root.path.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                scan_stats.last_error.clone().unwrap_or_else(|| "unspecified scan error".to_string()),
            ),
        };
        tracing::warn!(error = %err, count = scan_stats.io_errors, "scan encountered errors");
        err.observe(metrics);
    }

    outcome.considered = considered;
    metrics.add_candidates_considered(considered);

    let effective_mode = if cfg.dry_run { Mode::DryRun } else { mode };
    let reason = reason_for(mode);

    let mut deletes_since_recheck = 0usize;
    let mut deleted_this_root = 0u64;

    for candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        if outcome.deleted >= cfg.max_deletes_per_cycle {
            break;
        }
        if candidate.file_type != FileKind::Regular {
            continue;
        }
        if !eligible(&candidate, mode, root) {
            if matches!(mode, Mode::Age) {
                // AGE candidates are sorted age-desc; once one fails the
                // threshold, none after it qualify either.
                break;
            }
            continue;
        }

        let Some(meta) = revalidate(&candidate, root.follow_symlinks) else {
            // raced: logged only, no metric per spec scenario 5.
            tracing::info!(path = %candidate.path.display(), "skip: raced");
            continue;
        };

        let resolved = match candidate.path.canonicalize() {
            Ok(p) => p,
            Err(_) => continue,
        };
        if !still_safe(&resolved, &root_canonical, protected) {
            tracing::warn!(path = %candidate.path.display(), "refusing deletion outside scan root or protected path");
            continue;
        }

        let size = meta.len();
        let age_days = candidate.age_days;
        let path_str = candidate.path.display().to_string();

        if cfg.dry_run {
            // Lock only around the single append, not the whole root's
            // scan/sort/delete pass, so other roots' audit writes (and their
            // own deletion work) are never blocked behind this one (§5).
            let append_result = audit.lock().unwrap().append(now, &path_str, size, Mode::DryRun, reason, age_days);
            match append_result {
                Ok(_) => {
                    outcome.deleted += 1;
                    outcome.bytes_freed += size;
                    metrics.record_deletion(Mode::DryRun, size);
                }
                Err(e) => {
                    tracing::error!(error = %e, path = %path_str, "audit append failed");
                    outcome.errors += 1;
                    if e.is_unhealthy() {
                        outcome.severe_errors += 1;
                    }
                    e.observe(metrics);
                }
            }
            continue;
        }

        match std::fs::remove_file(&candidate.path) {
            Ok(()) => {
                let append_result =
                    audit.lock().unwrap().append(now, &path_str, size, effective_mode, reason, age_days);
                match append_result {
                    Ok(_) => {
                        outcome.deleted += 1;
                        outcome.bytes_freed += size;
                        deleted_this_root += 1;
                        metrics.record_deletion(effective_mode, size);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, path = %path_str, "audit append failed after unlink");
                        outcome.errors += 1;
                        if e.is_unhealthy() {
                            outcome.severe_errors += 1;
                        }
                        e.observe(metrics);
                    }
                }
            }
            Err(source) => {
                let err = AppError::DeleteIo { path: path_str.clone(), source };
                tracing::warn!(error = %err, path = %path_str, "delete failed");
                err.observe(metrics);
                outcome.errors += 1;
            }
        }

        deletes_since_recheck += 1;
        if matches!(mode, Mode::DiskUsage | Mode::Stack) && deletes_since_recheck >= PRESSURE_RECHECK_INTERVAL {
            deletes_since_recheck = 0;
            if let Ok(usage) = probe::usage(&root.path) {
                metrics.set_used_percent(&root.path.display().to_string(), usage.used_percent);
                if usage.used_percent < cfg.target_free_percent as f64 {
                    break;
                }
            }
        }
    }

    let _ = deleted_this_root;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStore;
    use std::fs;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    fn root(path: &Path, age_off: u64, stack_age: u64) -> ScanRoot {
        ScanRoot {
            path: path.to_path_buf(),
            age_off_days: age_off,
            stack_age_days: stack_age,
            stack_trigger_percent: None,
            include: vec![],
            exclude: vec![],
            follow_symlinks: false,
            cross_filesystem: true,
        }
    }

    fn shared(store: AuditStore) -> Arc<Mutex<AuditStore>> {
        Arc::new(Mutex::new(store))
    }

    fn protected_for(dir: &Path) -> ProtectedPaths {
        ProtectedPaths {
            audit_db: dir.join("does-not-exist.db"),
            config_file: dir.join("does-not-exist.yaml"),
            executable: dir.join("does-not-exist-exe"),
            pid_file: None,
        }
    }

    fn touch_with_age(path: &Path, age_days_ago: u64, size: usize) {
        fs::write(path, vec![0u8; size]).unwrap();
        let past = SystemTime::now() - StdDuration::from_secs(age_days_ago * 86_400 + 3600);
        let ft = filetime::FileTime::from_system_time(past);
        filetime::set_file_mtime(path, ft).unwrap();
    }

    fn base_config(dir: &Path) -> Config {
        Config {
            interval_minutes: 60,
            dry_run: false,
            max_free_percent: 80,
            target_free_percent: 70,
            stack_threshold: 95,
            stack_age_days: 3,
            max_deletes_per_cycle: 100_000,
            cycle_budget_seconds: 600,
            metrics_addr: "127.0.0.1:9090".into(),
            audit_db_path: dir.join("audit.db"),
            scan_roots: vec![],
            config_path: dir.join("config.yaml"),
        }
    }

    #[test]
    fn age_mode_deletes_oldest_first_boundary_inclusive() {
        let dir = tempdir().unwrap();
        touch_with_age(&dir.path().join("a.log"), 10, 1024); // A
        touch_with_age(&dir.path().join("b.log"), 7, 2048); // B, == threshold
        touch_with_age(&dir.path().join("c.log"), 6, 3072); // C, untouched
        touch_with_age(&dir.path().join("d.log"), 20, 1024); // D

        let cfg = base_config(dir.path());
        let audit = shared(AuditStore::open(&cfg.audit_db_path, false).unwrap());
        let metrics = Metrics::new();
        let protected = protected_for(dir.path());
        let cancel = CancellationToken::new();
        let r = root(dir.path(), 7, 3);

        let outcome = process_root(&r, Mode::Age, &cfg, &audit, &metrics, &protected, &cancel, Utc::now());

        assert_eq!(outcome.deleted, 3);
        assert_eq!(outcome.bytes_freed, 1024 + 2048 + 1024);
        assert!(dir.path().join("c.log").exists());
        assert!(!dir.path().join("a.log").exists());
        assert!(!dir.path().join("b.log").exists());
        assert!(!dir.path().join("d.log").exists());

        let recent = audit.lock().unwrap().recent(10).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.iter().all(|r| r.mode == Mode::Age));
    }

    #[test]
    fn stack_mode_respects_minimum_age_even_under_pressure() {
        let dir = tempdir().unwrap();
        touch_with_age(&dir.path().join("young.log"), 2, 1024); // below stack_age_days
        touch_with_age(&dir.path().join("old.log"), 4, 1024); // above stack_age_days, below age_off

        let cfg = base_config(dir.path());
        let audit = shared(AuditStore::open(&cfg.audit_db_path, false).unwrap());
        let metrics = Metrics::new();
        let protected = protected_for(dir.path());
        let cancel = CancellationToken::new();
        let r = root(dir.path(), 7, 3);

        let outcome = process_root(&r, Mode::Stack, &cfg, &audit, &metrics, &protected, &cancel, Utc::now());

        assert_eq!(outcome.deleted, 1);
        assert!(dir.path().join("young.log").exists());
        assert!(!dir.path().join("old.log").exists());
    }

    #[test]
    fn dry_run_does_not_mutate_filesystem_but_records_audit() {
        let dir = tempdir().unwrap();
        touch_with_age(&dir.path().join("old.log"), 15, 4096);

        let mut cfg = base_config(dir.path());
        cfg.dry_run = true;
        let audit = shared(AuditStore::open(&cfg.audit_db_path, false).unwrap());
        let metrics = Metrics::new();
        let protected = protected_for(dir.path());
        let cancel = CancellationToken::new();
        let r = root(dir.path(), 7, 3);

        let outcome = process_root(&r, Mode::Age, &cfg, &audit, &metrics, &protected, &cancel, Utc::now());

        assert_eq!(outcome.deleted, 1);
        assert!(dir.path().join("old.log").exists());
        let recent = audit.lock().unwrap().recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].mode, Mode::DryRun);
    }

    #[test]
    fn empty_root_is_a_no_op() {
        let dir = tempdir().unwrap();
        let cfg = base_config(dir.path());
        let audit = shared(AuditStore::open(&cfg.audit_db_path, false).unwrap());
        let metrics = Metrics::new();
        let protected = protected_for(dir.path());
        let cancel = CancellationToken::new();
        let r = root(dir.path(), 7, 3);

        let outcome = process_root(&r, Mode::Age, &cfg, &audit, &metrics, &protected, &cancel, Utc::now());
        assert_eq!(outcome.considered, 0);
        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.errors, 0);
    }

    #[test]
    fn select_mode_picks_stack_over_disk_usage_over_age() {
        let cfg = base_config(Path::new("/tmp"));
        let a = root(Path::new("/a"), 7, 3);
        let b = root(Path::new("/b"), 7, 3);
        let stack_usage = Usage { total_bytes: 100, free_bytes: 2, used_percent: 98.0 };
        let pressure_usage = Usage { total_bytes: 100, free_bytes: 15, used_percent: 85.0 };
        let healthy_usage = Usage { total_bytes: 100, free_bytes: 50, used_percent: 50.0 };

        assert_eq!(select_mode(&[(&a, stack_usage)], &cfg), Mode::Stack);
        assert_eq!(select_mode(&[(&a, pressure_usage)], &cfg), Mode::DiskUsage);
        assert_eq!(select_mode(&[(&a, healthy_usage)], &cfg), Mode::Age);
        assert_eq!(
            select_mode(&[(&a, healthy_usage), (&b, stack_usage)], &cfg),
            Mode::Stack
        );
    }

    #[test]
    fn select_mode_honors_per_root_stack_trigger_override() {
        let cfg = base_config(Path::new("/tmp"));
        let mut tight = root(Path::new("/a"), 7, 3);
        tight.stack_trigger_percent = Some(60);
        let usage_below_global_but_above_override =
            Usage { total_bytes: 100, free_bytes: 35, used_percent: 65.0 };

        assert_eq!(select_mode(&[(&tight, usage_below_global_but_above_override)], &cfg), Mode::Stack);
    }
}

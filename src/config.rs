use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

fn default_interval_minutes() -> u64 {
    60
}

fn default_cycle_budget_seconds() -> u64 {
    600
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_max_deletes_per_cycle() -> u64 {
    0
}

const SAFETY_MAX_DELETES_PER_CYCLE: u64 = 100_000;

/// One directory the daemon is authorised to manage, as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanRootSpec {
    pub path: PathBuf,
    pub age_off_days: u64,
    #[serde(default)]
    pub stack_age_days: Option<u64>,
    #[serde(default)]
    pub stack_trigger_percent: Option<u8>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub cross_filesystem: bool,
}

/// Validated, immutable view of a `ScanRootSpec` used by the Scanner and
/// Policy Engine. Distinct from `ScanRootSpec` so invariants only need
/// checking once, at load time.
#[derive(Debug, Clone)]
pub struct ScanRoot {
    pub path: PathBuf,
    pub age_off_days: u64,
    pub stack_age_days: u64,
    pub stack_trigger_percent: Option<u8>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub follow_symlinks: bool,
    pub cross_filesystem: bool,
}

/// Raw, as-written YAML document. Deserialized first, then validated into
/// `Config`. Unknown top-level keys are rejected loudly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub dry_run: bool,
    pub max_free_percent: u8,
    pub target_free_percent: u8,
    pub stack_threshold: u8,
    #[serde(default)]
    pub stack_age_days: u64,
    #[serde(default = "default_max_deletes_per_cycle")]
    pub max_deletes_per_cycle: u64,
    #[serde(default = "default_cycle_budget_seconds")]
    pub cycle_budget_seconds: u64,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    pub audit_db_path: PathBuf,
    pub scan_paths: Vec<ScanRootSpec>,
}

/// Validated, immutable snapshot of policy parameters and scan roots. Once
/// constructed, a `Config` is guaranteed to satisfy every invariant in
/// `spec.md` §3.
#[derive(Debug, Clone)]
pub struct Config {
    pub interval_minutes: u64,
    pub dry_run: bool,
    pub max_free_percent: u8,
    pub target_free_percent: u8,
    pub stack_threshold: u8,
    pub stack_age_days: u64,
    pub max_deletes_per_cycle: u64,
    pub cycle_budget_seconds: u64,
    pub metrics_addr: String,
    pub audit_db_path: PathBuf,
    pub scan_roots: Vec<ScanRoot>,
    pub config_path: PathBuf,
}

impl Config {
    /// Load, parse, and validate a YAML config file. Does not apply CLI
    /// overrides; callers (`main.rs`) apply those afterward.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("reading {}: {e}", path.display())))?;
        let raw: RawConfig = serde_yaml::from_str(&text)
            .map_err(|e| AppError::Config(format!("parsing {}: {e}", path.display())))?;
        Self::from_raw(raw, path.to_path_buf())
    }

    fn from_raw(raw: RawConfig, config_path: PathBuf) -> Result<Self, AppError> {
        if raw.interval_minutes < 1 {
            return Err(AppError::Config("interval_minutes must be >= 1".into()));
        }
        if raw.cycle_budget_seconds < 1 {
            return Err(AppError::Config("cycle_budget_seconds must be >= 1".into()));
        }
        if !(raw.target_free_percent < raw.max_free_percent
            && raw.max_free_percent < raw.stack_threshold
            && raw.stack_threshold <= 100)
        {
            return Err(AppError::Config(
                "invariant violated: target_free_percent < max_free_percent < stack_threshold <= 100"
                    .into(),
            ));
        }
        if raw.target_free_percent < 1 || raw.target_free_percent > 99 {
            return Err(AppError::Config("target_free_percent must be 1-99".into()));
        }
        if raw.max_free_percent < 1 || raw.max_free_percent > 99 {
            return Err(AppError::Config("max_free_percent must be 1-99".into()));
        }
        if raw.scan_paths.is_empty() {
            return Err(AppError::Config("scan_paths must not be empty".into()));
        }

        let mut scan_roots = Vec::with_capacity(raw.scan_paths.len());
        for spec in raw.scan_paths {
            let stack_age_days = spec.stack_age_days.unwrap_or(raw.stack_age_days);
            if stack_age_days > spec.age_off_days {
                return Err(AppError::Config(format!(
                    "scan root {}: stack_age_days ({stack_age_days}) must be <= age_off_days ({})",
                    spec.path.display(),
                    spec.age_off_days
                )));
            }
            if !spec.path.is_absolute() {
                return Err(AppError::Config(format!(
                    "scan root path must be absolute: {}",
                    spec.path.display()
                )));
            }
            scan_roots.push(ScanRoot {
                path: spec.path,
                age_off_days: spec.age_off_days,
                stack_age_days,
                stack_trigger_percent: spec.stack_trigger_percent,
                include: spec.include,
                exclude: spec.exclude,
                follow_symlinks: spec.follow_symlinks,
                cross_filesystem: spec.cross_filesystem,
            });
        }

        let max_deletes_per_cycle = if raw.max_deletes_per_cycle == 0 {
            SAFETY_MAX_DELETES_PER_CYCLE
        } else {
            raw.max_deletes_per_cycle.min(SAFETY_MAX_DELETES_PER_CYCLE)
        };

        Ok(Config {
            interval_minutes: raw.interval_minutes,
            dry_run: raw.dry_run,
            max_free_percent: raw.max_free_percent,
            target_free_percent: raw.target_free_percent,
            stack_threshold: raw.stack_threshold,
            stack_age_days: raw.stack_age_days,
            max_deletes_per_cycle,
            cycle_budget_seconds: raw.cycle_budget_seconds,
            metrics_addr: raw.metrics_addr,
            audit_db_path: raw.audit_db_path,
            scan_roots,
            config_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_raw() -> RawConfig {
        RawConfig {
            interval_minutes: 60,
            dry_run: false,
            max_free_percent: 80,
            target_free_percent: 70,
            stack_threshold: 95,
            stack_age_days: 3,
            max_deletes_per_cycle: 0,
            cycle_budget_seconds: 600,
            metrics_addr: default_metrics_addr(),
            audit_db_path: PathBuf::from("/tmp/audit.db"),
            scan_paths: vec![ScanRootSpec {
                path: PathBuf::from("/data"),
                age_off_days: 7,
                stack_age_days: None,
                stack_trigger_percent: None,
                include: vec![],
                exclude: vec![],
                follow_symlinks: false,
                cross_filesystem: false,
            }],
        }
    }

    #[test]
    fn rejects_threshold_order_violation() {
        let mut raw = base_raw();
        raw.target_free_percent = 90;
        let err = Config::from_raw(raw, PathBuf::from("cfg.yaml")).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn rejects_zero_cycle_budget() {
        let mut raw = base_raw();
        raw.cycle_budget_seconds = 0;
        let err = Config::from_raw(raw, PathBuf::from("cfg.yaml")).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn rejects_stack_age_above_age_off() {
        let mut raw = base_raw();
        raw.scan_paths[0].age_off_days = 2;
        raw.stack_age_days = 3;
        assert!(Config::from_raw(raw, PathBuf::from("cfg.yaml")).is_err());
    }

    #[test]
    fn zero_max_deletes_falls_back_to_safety_default() {
        let raw = base_raw();
        let cfg = Config::from_raw(raw, PathBuf::from("cfg.yaml")).unwrap();
        assert_eq!(cfg.max_deletes_per_cycle, SAFETY_MAX_DELETES_PER_CYCLE);
    }

    #[test]
    fn accepts_valid_config() {
        let raw = base_raw();
        let cfg = Config::from_raw(raw, PathBuf::from("cfg.yaml")).unwrap();
        assert_eq!(cfg.scan_roots.len(), 1);
        assert_eq!(cfg.scan_roots[0].stack_age_days, 3);
    }
}

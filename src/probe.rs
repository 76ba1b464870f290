//! Filesystem Probe: reports free-space ratio and mountpoint info for a
//! path. No caching across cycles — every call re-queries the kernel.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::AppError;

/// Disk usage snapshot for the filesystem backing a path.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Usage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_percent: f64,
}

/// Query total/free bytes and used-percent for the filesystem containing
/// `path`, via `statfs(2)`.
pub fn usage(path: &Path) -> Result<Usage, AppError> {
    let stat = nix::sys::statfs::statfs(path).map_err(|errno| AppError::ProbeIo {
        path: path.display().to_string(),
        source: std::io::Error::from_raw_os_error(errno as i32),
    })?;

    let block_size = stat.block_size().max(0) as u64;
    let total_blocks = stat.blocks();
    // `blocks_available()` excludes the root-reserved reserve, matching the
    // free space visible to the unprivileged user this daemon runs as;
    // `blocks_free()` would understate pressure by counting blocks this
    // process could never actually claim.
    let free_blocks = stat.blocks_available();

    let total_bytes = block_size.saturating_mul(total_blocks);
    let free_bytes = block_size.saturating_mul(free_blocks);

    let used_percent = if total_bytes == 0 {
        0.0
    } else {
        100.0 * (total_bytes.saturating_sub(free_bytes)) as f64 / total_bytes as f64
    };

    Ok(Usage {
        total_bytes,
        free_bytes,
        used_percent,
    })
}

/// Find the mountpoint containing `path` by walking parents until the
/// device id (`st_dev`) changes.
pub fn mountpoint(path: &Path) -> Result<PathBuf, AppError> {
    let meta = std::fs::metadata(path).map_err(|e| AppError::ProbeIo {
        path: path.display().to_string(),
        source: e,
    })?;
    let dev = meta.dev();

    let mut current = path
        .canonicalize()
        .map_err(|e| AppError::ProbeIo { path: path.display().to_string(), source: e })?;

    loop {
        let parent = match current.parent() {
            Some(p) => p,
            None => return Ok(current),
        };
        let parent_meta = std::fs::metadata(parent).map_err(|e| AppError::ProbeIo {
            path: parent.display().to_string(),
            source: e,
        })?;
        if parent_meta.dev() != dev {
            return Ok(current);
        }
        current = parent.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_of_tmp_is_sane() {
        let u = usage(Path::new("/tmp")).unwrap();
        assert!(u.total_bytes > 0);
        assert!(u.used_percent >= 0.0 && u.used_percent <= 100.0);
    }

    #[test]
    fn mountpoint_of_root_is_root() {
        let mp = mountpoint(Path::new("/")).unwrap();
        assert_eq!(mp, PathBuf::from("/"));
    }
}

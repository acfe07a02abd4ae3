//! Cache root resolution

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that pins the cache root
pub const CACHE_DIR_ENV: &str = "MEMENTO_CACHE_DIR";

/// Inputs for determining cache root directory
#[derive(Debug, Clone)]
struct CacheInputs {
    memento_cache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) MEMENTO_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/memento
    // 3) OS cache dir/memento
    // 4) ~/.memento/cache
    // 5) TMPDIR/memento/cache (fallback)
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.memento_cache_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("memento"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("memento"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".memento/cache"));
    }
    candidates.push(inputs.temp_dir.join("memento/cache"));

    candidates
        .into_iter()
        .find(|path| usable(path))
        .ok_or_else(|| Error::configuration("Failed to determine a writable cache directory"))
}

/// Existing and writable, or creatable
fn usable(path: &Path) -> bool {
    if path.starts_with("/homeless-shelter") {
        return false;
    }
    if !path.exists() {
        return fs::create_dir_all(path).is_ok();
    }
    // An existing directory may still be read-only (common for CI caches under $HOME)
    let probe = path.join(".write_probe");
    let writable = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
        .is_ok();
    if writable {
        let _ = fs::remove_file(&probe);
    } else {
        debug!(path = %path.display(), "Cache root candidate not writable");
    }
    writable
}

fn non_empty_env(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Resolve the default cache root from the environment
pub fn cache_root() -> Result<PathBuf> {
    let inputs = CacheInputs {
        memento_cache_dir: non_empty_env(CACHE_DIR_ENV),
        xdg_cache_home: non_empty_env("XDG_CACHE_HOME"),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_root_from_inputs(inputs)
}

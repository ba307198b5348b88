use intel_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `INTEL_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `start` looking for `.intel/`
/// 3. Fall back to `start`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_root_from(&cwd)
}

fn find_root_from(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(paths::INTEL_DIR).is_dir())
        .unwrap_or(start)
        .to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn finds_intel_dir_above_start() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".intel")).unwrap();
        let deep = dir.path().join("reports/2026/q3");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(find_root_from(&deep), dir.path());
    }

    #[test]
    fn falls_back_to_start() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("plain");
        std::fs::create_dir_all(&sub).unwrap();
        assert_eq!(find_root_from(&sub), sub);
    }
}

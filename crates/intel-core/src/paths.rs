use std::path::{Path, PathBuf};

pub const INTEL_DIR: &str = ".intel";
pub const CONFIG_FILE: &str = ".intel/config.yaml";
pub const DB_FILE: &str = ".intel/intel.db";

pub fn intel_dir(root: &Path) -> PathBuf {
    root.join(INTEL_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

use std::path::{Path, PathBuf};

pub const PORTABLE_MARKER: &str = "romtool.config.json";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn is_portable_root(path: &Path) -> bool {
    path.join(PORTABLE_MARKER).exists()
}

fn platform_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        env_dir("APPDATA").map(|dir| dir.join("romtool"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        env_dir("XDG_DATA_HOME")
            .or_else(|| env_dir("HOME").map(|home| home.join(".local").join("share")))
            .map(|dir| dir.join("romtool"))
    }
}

/// Directory holding the config file and logs.
pub fn resolve_root_dir() -> PathBuf {
    if let Some(path) = env_dir("ROMTOOL_ROOT_DIR") {
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
    }

    if let Some(dir) = exe_dir() {
        if is_portable_root(&dir) {
            return dir;
        }
    }

    if let Some(data) = platform_data_dir() {
        if let Some(found) = ensure_dir(&data) {
            return found;
        }
    }

    PathBuf::from(".")
}

/// Anchor for the bundled converter binaries (`<base>/bin/...`).
pub fn resolve_base_dir() -> PathBuf {
    if let Some(path) = env_dir("ROMTOOL_BASE") {
        return path;
    }
    if let Some(dir) = exe_dir() {
        if dir.join("bin").is_dir() {
            return dir;
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(path) = env_dir("ROMTOOL_LOG_DIR") {
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
    }

    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join("logs");
        if let Some(found) = ensure_dir(&candidate) {
            return found;
        }
    }

    PathBuf::from("logs")
}

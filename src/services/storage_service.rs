use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::Disks;

use crate::config::RomToolConfig;
use crate::errors::StorageError;
use crate::utils::file::{move_path, remove_path};

pub trait FreeSpaceSource: Send + Sync {
    /// Free bytes on the volume that holds `path`, `None` when unknown.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Reads free space from the mounted disk list.
pub struct SystemDisks;

impl FreeSpaceSource for SystemDisks {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let target = nearest_existing_path(path);
        let target = fs::canonicalize(&target)
            .map(|resolved| without_verbatim_prefix(&resolved))
            .unwrap_or(target);
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(&Path, u64)> = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point(), disk.available_space()))
            .collect();

        let available = deepest_mount(&target, &mounts);
        if available.is_none() {
            tracing::warn!("no mounted disk holds {}", target.display());
        }
        available
    }
}

/// Free space of the longest mount point containing `target`.
fn deepest_mount(target: &Path, mounts: &[(&Path, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| target.starts_with(mount))
        .max_by_key(|(mount, _)| mount.as_os_str().len())
        .map(|(_, available)| *available)
}

/// `canonicalize` on Windows yields `\\?\D:\...`, which never shares a
/// prefix with mount points such as `D:\`.
fn without_verbatim_prefix(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
        PathBuf::from(format!(r"\\{}", rest))
    } else if let Some(rest) = text.strip_prefix(r"\\?\") {
        PathBuf::from(rest)
    } else {
        path.to_path_buf()
    }
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

#[derive(Clone)]
pub struct StorageService {
    space: Arc<dyn FreeSpaceSource>,
    safety_buffer: u64,
}

impl StorageService {
    pub fn new(space: Arc<dyn FreeSpaceSource>, safety_buffer: u64) -> Self {
        Self {
            space,
            safety_buffer,
        }
    }

    pub fn from_config(config: &RomToolConfig) -> Self {
        Self::new(Arc::new(SystemDisks), config.safety_buffer)
    }

    pub fn safety_buffer(&self) -> u64 {
        self.safety_buffer
    }

    /// Passes when free space covers `required` plus the safety buffer;
    /// equality passes. Returns the free byte count.
    pub fn check_disk_space(&self, dest: &Path, required: u64) -> Result<u64, StorageError> {
        let available = self
            .space
            .available_bytes(dest)
            .ok_or_else(|| StorageError::SpaceUnknown(dest.to_path_buf()))?;
        let needed = required.saturating_add(self.safety_buffer);
        tracing::debug!(
            "space check for {}: need {} bytes, {} available",
            dest.display(),
            needed,
            available
        );
        if available < needed {
            return Err(StorageError::InsufficientSpace {
                required: needed,
                available,
            });
        }
        Ok(available)
    }

    /// Moves converted output into `dest`. A lone child directory lands at
    /// `dest/<child>`; anything else lands under `dest/<source name>/`.
    /// Existing targets are replaced.
    pub fn install(&self, source: &Path, dest: &Path) -> Result<PathBuf, StorageError> {
        let mut children = fs::read_dir(source)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()?;
        children.sort();
        if children.is_empty() {
            return Err(StorageError::EmptySource(source.to_path_buf()));
        }
        fs::create_dir_all(dest)?;

        if children.len() == 1 && children[0].is_dir() {
            let child = &children[0];
            let target = dest.join(file_name_of(child)?);
            replace_with(child, &target)?;
            tracing::info!("installed {}", target.display());
            return Ok(target);
        }

        let target_root = dest.join(file_name_of(source)?);
        fs::create_dir_all(&target_root)?;
        for child in &children {
            replace_with(child, &target_root.join(file_name_of(child)?))?;
        }
        tracing::info!(
            "installed {} entries into {}",
            children.len(),
            target_root.display()
        );
        Ok(target_root)
    }

    /// Best effort; a failure is logged and reported as `false`.
    pub fn cleanup_temp(&self, dir: &Path) -> bool {
        match remove_path(dir) {
            Ok(()) => {
                tracing::debug!("removed temp dir {}", dir.display());
                true
            }
            Err(err) => {
                tracing::warn!("failed to clean up temp dir {}: {}", dir.display(), err);
                false
            }
        }
    }
}

fn file_name_of(path: &Path) -> Result<&std::ffi::OsStr, StorageError> {
    path.file_name().ok_or_else(|| StorageError::Move {
        from: path.to_path_buf(),
        to: PathBuf::new(),
        reason: "path has no final component".to_string(),
    })
}

fn replace_with(from: &Path, to: &Path) -> Result<(), StorageError> {
    let move_error = |err: io::Error| StorageError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason: err.to_string(),
    };
    if to.exists() {
        tracing::debug!("replacing existing {}", to.display());
        remove_path(to).map_err(move_error)?;
    }
    move_path(from, to).map_err(move_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::test_support::FixedFreeSpace;

    const BUFFER: u64 = 512 * 1024 * 1024;

    fn storage(free: u64) -> StorageService {
        StorageService::new(Arc::new(FixedFreeSpace(free)), BUFFER)
    }

    #[test]
    fn space_check_boundary_is_inclusive() {
        let temp = tempdir().expect("tempdir");
        let required = 9 * 1024 * 1024 * 1024;

        let free = storage(required + BUFFER)
            .check_disk_space(temp.path(), required)
            .expect("exactly enough passes");
        assert_eq!(free, required + BUFFER);

        let err = storage(required + BUFFER - 1)
            .check_disk_space(temp.path(), required)
            .expect_err("one byte short fails");
        match err {
            StorageError::InsufficientSpace {
                required: needed,
                available,
            } => {
                assert_eq!(needed, required + BUFFER);
                assert_eq!(available, required + BUFFER - 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn single_directory_moves_whole() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("converted");
        fs::create_dir_all(source.join("Halo 3").join("media")).expect("create tree");
        fs::write(source.join("Halo 3").join("default.xex"), b"xex").expect("write xex");
        let dest = temp.path().join("games");

        let installed = storage(u64::MAX).install(&source, &dest).expect("install");

        assert_eq!(installed, dest.join("Halo 3"));
        assert_eq!(fs::read(installed.join("default.xex")).unwrap(), b"xex");
        assert!(installed.join("media").is_dir());
        assert!(!dest.join("converted").exists());
    }

    #[test]
    fn loose_files_go_under_source_name() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("converted");
        fs::create_dir_all(&source).expect("create source");
        fs::write(source.join("a.bin"), b"a").expect("write a");
        fs::write(source.join("b.bin"), b"b").expect("write b");
        let dest = temp.path().join("games");

        let installed = storage(u64::MAX).install(&source, &dest).expect("install");

        assert_eq!(installed, dest.join("converted"));
        assert_eq!(fs::read(installed.join("a.bin")).unwrap(), b"a");
        assert_eq!(fs::read(installed.join("b.bin")).unwrap(), b"b");
    }

    #[test]
    fn existing_target_is_replaced() {
        let temp = tempdir().expect("tempdir");
        let dest = temp.path().join("games");
        fs::create_dir_all(dest.join("Fable II")).expect("create old install");
        fs::write(dest.join("Fable II").join("stale.txt"), b"old").expect("write stale");

        let source = temp.path().join("converted");
        fs::create_dir_all(source.join("Fable II")).expect("create source");
        fs::write(source.join("Fable II").join("fresh.txt"), b"new").expect("write fresh");

        let installed = storage(u64::MAX).install(&source, &dest).expect("install");

        assert!(!installed.join("stale.txt").exists());
        assert_eq!(fs::read(installed.join("fresh.txt")).unwrap(), b"new");
    }

    #[test]
    fn empty_source_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("converted");
        fs::create_dir_all(&source).expect("create source");

        let err = storage(u64::MAX)
            .install(&source, &temp.path().join("games"))
            .expect_err("nothing to install");
        assert!(matches!(err, StorageError::EmptySource(path) if path == source));
    }

    #[test]
    fn verbatim_prefixes_are_stripped() {
        assert_eq!(
            without_verbatim_prefix(Path::new(r"\\?\D:\games\xbox")),
            PathBuf::from(r"D:\games\xbox")
        );
        assert_eq!(
            without_verbatim_prefix(Path::new(r"\\?\UNC\nas\share\roms")),
            PathBuf::from(r"\\nas\share\roms")
        );
        assert_eq!(
            without_verbatim_prefix(Path::new("/mnt/games")),
            PathBuf::from("/mnt/games")
        );
    }

    #[test]
    fn deepest_mount_wins_and_unmatched_paths_are_unknown() {
        let mounts = [
            (Path::new("/"), 10),
            (Path::new("/mnt/games"), 500),
            (Path::new("/mnt"), 20),
        ];
        assert_eq!(deepest_mount(Path::new("/mnt/games/halo"), &mounts), Some(500));
        assert_eq!(deepest_mount(Path::new("/home/user"), &mounts), Some(10));
        assert_eq!(deepest_mount(Path::new("/mnt/gamesx"), &mounts), Some(20));

        let no_root = [(Path::new("/mnt/games"), 500)];
        assert_eq!(deepest_mount(Path::new("/home/user"), &no_root), None);
    }

    #[cfg(windows)]
    #[test]
    fn canonical_windows_paths_match_drive_mounts() {
        let temp = tempdir().expect("tempdir");
        let resolved = without_verbatim_prefix(&fs::canonicalize(temp.path()).expect("canonicalize"));
        let drive: PathBuf = resolved.components().take(2).collect();
        let mounts = [(Path::new(r"Z:\"), 1), (drive.as_path(), 42)];
        assert_eq!(deepest_mount(&resolved, &mounts), Some(42));
    }

    #[test]
    fn cleanup_reports_success() {
        let temp = tempdir().expect("tempdir");
        let work = temp.path().join("romtool_test");
        fs::create_dir_all(work.join("extracted")).expect("create work dir");

        let service = storage(u64::MAX);
        assert!(service.cleanup_temp(&work));
        assert!(!work.exists());
        assert!(service.cleanup_temp(&work));
    }
}

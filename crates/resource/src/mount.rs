//! §4.7 Mount/Storage helpers (I): classify host mount sources by path shape
//! and resolve kubelet subpaths back to their empty-dir root.
use crate::error::MountError;
use std::path::{Path, PathBuf};

const WATCHABLE_FILE_CAP: usize = 8;

/// The four host mount source categories a Kubernetes-style caller cares
/// about, detected purely from the path shape (no stat call needed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    DockerVolume,
    EmptyDir,
    ConfigMap,
    Secret,
    Other,
}

/// Classifies a host mount source path (§8 S7).
pub fn classify(source: &str) -> SourceKind {
    if source.contains("/kubernetes.io~empty-dir/") {
        SourceKind::EmptyDir
    } else if source.contains("/kubernetes.io~configmap/") {
        SourceKind::ConfigMap
    } else if source.contains("/kubernetes.io~secret/") {
        SourceKind::Secret
    } else if source.contains("/docker/volumes/") && source.ends_with("/_data") {
        SourceKind::DockerVolume
    } else {
        SourceKind::Other
    }
}

/// Ephemeral storage is empty-dir backed by tmpfs.
pub fn is_ephemeral(source: &str, fs_type: &str) -> bool {
    classify(source) == SourceKind::EmptyDir && fs_type == "tmpfs"
}

/// Watchable when the source is a configmap/secret mount and its file count
/// is nonzero and at most `WATCHABLE_FILE_CAP` (§8 S7: "watchable when
/// file-count ≤ 8 and > 0").
pub fn is_watchable(kind: SourceKind, file_count: usize) -> bool {
    matches!(kind, SourceKind::ConfigMap | SourceKind::Secret)
        && file_count > 0
        && file_count <= WATCHABLE_FILE_CAP
}

pub fn count_files(dir: &Path) -> Result<usize, MountError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| MountError::Io(dir.display().to_string(), e))?;
    let mut count = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| MountError::Io(dir.display().to_string(), e))?;
        if entry
            .file_type()
            .map_err(|e| MountError::Io(dir.display().to_string(), e))?
            .is_file()
        {
            count += 1;
        }
    }
    Ok(count)
}

/// Resolves a kubelet `volume-subpaths` bind mount: `/proc/<pid>/fd/<fd>`
/// must point back under `empty_dir_root`, and the remainder becomes the
/// subpath. Any `..` component is rejected before being trusted (§4.7).
pub fn resolve_subpath(pid: u32, fd: u32, empty_dir_root: &Path) -> Result<PathBuf, MountError> {
    let link = format!("/proc/{pid}/fd/{fd}");
    let target = std::fs::read_link(&link).map_err(|e| MountError::Io(link.clone(), e))?;

    if target
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(MountError::PathEscape(target.display().to_string()));
    }

    let relative = target
        .strip_prefix(empty_dir_root)
        .map_err(|_| MountError::NotEmptyDir(link))?;
    Ok(relative.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_docker_volume() {
        assert_eq!(
            classify("/var/lib/docker/volumes/XYZ/_data"),
            SourceKind::DockerVolume
        );
    }

    #[test]
    fn classifies_secret_and_reports_watchability() {
        let path = "/var/lib/kubelet/pods/p/volumes/kubernetes.io~secret/tok";
        let kind = classify(path);
        assert_eq!(kind, SourceKind::Secret);
        assert!(is_watchable(kind, 8));
        assert!(!is_watchable(kind, 9));
        assert!(!is_watchable(kind, 0));
    }

    #[test]
    fn empty_dir_on_tmpfs_is_ephemeral() {
        let path = "/var/lib/kubelet/pods/p/volumes/kubernetes.io~empty-dir/cache";
        assert!(is_ephemeral(path, "tmpfs"));
        assert!(!is_ephemeral(path, "ext4"));
    }

    #[test]
    fn subpath_rejects_parent_dir_escape() {
        let err = resolve_subpath_from_target(Path::new("../../etc/passwd"), Path::new("/var/empty"));
        assert!(matches!(err, Err(MountError::PathEscape(_))));
    }

    fn resolve_subpath_from_target(
        target: &Path,
        root: &Path,
    ) -> Result<PathBuf, MountError> {
        if target
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(MountError::PathEscape(target.display().to_string()));
        }
        target
            .strip_prefix(root)
            .map(|p| p.to_path_buf())
            .map_err(|_| MountError::NotEmptyDir(target.display().to_string()))
    }
}

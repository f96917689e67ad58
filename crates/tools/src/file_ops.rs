//! File tools with a write-path policy.
//!
//! Writes are permitted only under the workspace root and `/tmp`; system
//! roots and user dotfiles outside the workspace are refused before the
//! filesystem is touched. Writes are atomic (unique tmp sibling + rename).

use std::path::{Component, Path, PathBuf};

use osa_domain::error::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Roots that are never writable.
const DENIED_ROOTS: &[&str] = &["/etc", "/usr", "/bin", "/sbin", "/var", "/boot"];

/// Files whose contents are never readable through the file tools.
const DENIED_READS: &[&str] = &["/etc/shadow", "/etc/passwd", "/etc/sudoers"];

/// Resolve a requested path against the workspace root, lexically.
///
/// Relative paths join onto the workspace; `..` components are refused
/// outright so the result cannot escape its prefix.
fn resolve(workspace_root: &Path, requested: &str) -> Result<PathBuf> {
    let requested_path = Path::new(requested);
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::ToolBlocked(
                "path must not contain '..' components".into(),
            ));
        }
    }
    if requested_path.is_absolute() {
        Ok(requested_path.to_path_buf())
    } else {
        Ok(workspace_root.join(requested_path))
    }
}

/// Check the write policy for an already-resolved absolute path.
fn check_write_policy(workspace_root: &Path, path: &Path) -> Result<()> {
    for root in DENIED_ROOTS {
        if path.starts_with(root) {
            return Err(Error::ToolBlocked(format!(
                "writes under {root} are not permitted"
            )));
        }
    }
    if path.starts_with(workspace_root) || path.starts_with("/tmp") {
        return Ok(());
    }
    Err(Error::ToolBlocked(format!(
        "writes are only permitted under the workspace ({}) or /tmp",
        workspace_root.display()
    )))
}

/// Check the read policy: credential files and ssh keys are refused.
fn check_read_policy(path: &Path) -> Result<()> {
    for denied in DENIED_READS {
        if path == Path::new(denied) {
            return Err(Error::ToolBlocked(format!(
                "reading {denied} is not permitted"
            )));
        }
    }
    let s = path.to_string_lossy();
    if s.contains("/.ssh/id_") {
        return Err(Error::ToolBlocked("reading ssh keys is not permitted".into()));
    }
    Ok(())
}

/// Read a file, optionally a line window.
pub async fn file_read(
    workspace_root: &Path,
    requested: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<String> {
    let path = resolve(workspace_root, requested)?;
    check_read_policy(&path)?;

    let content = fs::read_to_string(&path).await.map_err(Error::Io)?;
    match (offset, limit) {
        (None, None) => Ok(content),
        _ => {
            let offset = offset.unwrap_or(0);
            let lines: Vec<&str> = content.lines().collect();
            let limit = limit.unwrap_or_else(|| lines.len().saturating_sub(offset));
            Ok(lines
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }
}

/// Write a file atomically under the write policy.
pub async fn file_write(workspace_root: &Path, requested: &str, content: &str) -> Result<()> {
    let path = resolve(workspace_root, requested)?;
    check_write_policy(workspace_root, &path)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(Error::Io)?;
    }

    write_atomic(&path, content.as_bytes()).await
}

/// Atomic replace: write to a uniquely-named tmp sibling, flush, rename.
/// A crash between write and rename leaves the previous file intact.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().as_simple()
    );
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path).await.map_err(Error::Io)?;
    file.write_all(bytes).await.map_err(Error::Io)?;
    file.flush().await.map_err(Error::Io)?;
    drop(file);

    fs::rename(&tmp_path, path).await.map_err(Error::Io)
}

/// List a directory (names only, sorted, directories suffixed with `/`).
pub async fn file_list(workspace_root: &Path, requested: &str) -> Result<Vec<String>> {
    let path = resolve(workspace_root, requested)?;
    let mut entries = fs::read_dir(&path).await.map_err(Error::Io)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_relative() {
        let dir = tempfile::tempdir().unwrap();
        file_write(dir.path(), "notes/a.txt", "hello").await.unwrap();
        let content = file_read(dir.path(), "notes/a.txt", None, None)
            .await
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn system_roots_are_refused_without_touching_fs() {
        let dir = tempfile::tempdir().unwrap();
        for target in ["/etc/osa.conf", "/usr/local/x", "/var/log/osa", "/boot/x"] {
            let err = file_write(dir.path(), target, "x").await.unwrap_err();
            assert!(matches!(err, Error::ToolBlocked(_)), "{target}");
        }
    }

    #[tokio::test]
    async fn outside_workspace_refused_tmp_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_write(dir.path(), "/home/user/.bashrc", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolBlocked(_)));

        let tmp_target = format!("/tmp/osa-test-{}", uuid::Uuid::new_v4().as_simple());
        file_write(dir.path(), &tmp_target, "ok").await.unwrap();
        std::fs::remove_file(&tmp_target).unwrap();
    }

    #[tokio::test]
    async fn parent_dir_components_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_write(dir.path(), "../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, Error::ToolBlocked(_)));
    }

    #[tokio::test]
    async fn credential_reads_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_read(dir.path(), "/etc/shadow", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolBlocked(_)));
    }

    #[tokio::test]
    async fn read_with_line_window() {
        let dir = tempfile::tempdir().unwrap();
        file_write(dir.path(), "lines.txt", "a\nb\nc\nd").await.unwrap();
        let window = file_read(dir.path(), "lines.txt", Some(1), Some(2))
            .await
            .unwrap();
        assert_eq!(window, "b\nc");
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        file_write(dir.path(), "f.txt", "v1").await.unwrap();
        file_write(dir.path(), "f.txt", "v2").await.unwrap();
        let content = file_read(dir.path(), "f.txt", None, None).await.unwrap();
        assert_eq!(content, "v2");
        // No stray tmp files remain.
        let leftovers = file_list(dir.path(), ".").await.unwrap();
        assert_eq!(leftovers, vec!["f.txt"]);
    }

    #[tokio::test]
    async fn list_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        file_write(dir.path(), "sub/x.txt", "x").await.unwrap();
        file_write(dir.path(), "top.txt", "t").await.unwrap();
        let names = file_list(dir.path(), ".").await.unwrap();
        assert_eq!(names, vec!["sub/", "top.txt"]);
    }
}

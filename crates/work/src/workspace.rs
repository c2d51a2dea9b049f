//! Per-run workspaces and durable output copies.

use stagegate_core::{Stage, WorkItemId};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch directory private to one stage execution of one work item.
///
/// Removed when dropped, whether the stage succeeded, failed or was
/// cancelled.
#[derive(Debug)]
pub struct RunWorkspace {
    dir: TempDir,
}

impl RunWorkspace {
    /// Create a workspace under `root` (system temp when `None`).
    pub fn create(root: Option<&Path>, work_item: &WorkItemId, stage: Stage) -> std::io::Result<Self> {
        let prefix = format!("stagegate-{}-{}-", work_item, stage);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!(work_item = %work_item, stage = %stage, "Workspace: {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Workspace path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Replace `dest_dir`'s contents with a copy of `src` (file or directory)
/// and return the path of the copy.
///
/// Fails with `InvalidData` when `src` is an empty file or holds no files.
pub async fn copy_output(src: &Path, dest_dir: &Path) -> std::io::Result<PathBuf> {
    let meta = tokio::fs::metadata(src).await?;
    let name = src
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output".into());

    if tokio::fs::metadata(dest_dir).await.is_ok() {
        tokio::fs::remove_dir_all(dest_dir).await?;
    }
    tokio::fs::create_dir_all(dest_dir).await?;
    let dest = dest_dir.join(name);

    let copied = if meta.is_file() {
        tokio::fs::copy(src, &dest).await?
    } else {
        copy_dir(src, &dest).await?
    };
    if copied == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("output {} is empty", src.display()),
        ));
    }
    Ok(dest)
}

/// Copy a tree, returning the number of bytes copied.
async fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                total += tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> WorkItemId {
        WorkItemId::new(s).unwrap()
    }

    #[test]
    fn test_workspaces_are_distinct_and_removed() {
        let root = TempDir::new().unwrap();
        let a = RunWorkspace::create(Some(root.path()), &id("a"), Stage::MetadataGeneration).unwrap();
        let b = RunWorkspace::create(Some(root.path()), &id("a"), Stage::MetadataGeneration).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(root.path()));

        let kept = b.path().to_path_buf();
        let gone = a.path().to_path_buf();
        drop(a);
        assert!(!gone.exists());
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_copy_output_replaces_previous_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("images")).unwrap();
        std::fs::write(src.join("book.md"), "# Book").unwrap();
        std::fs::write(src.join("images/cover.txt"), "cover").unwrap();

        let dest_dir = tmp.path().join("store/outputs/content-finalization");
        std::fs::create_dir_all(&dest_dir).unwrap();
        std::fs::write(dest_dir.join("stale.txt"), "old").unwrap();

        let copy = copy_output(&src, &dest_dir).await.unwrap();
        assert_eq!(copy, dest_dir.join("src"));
        assert!(copy.join("images/cover.txt").exists());
        assert!(!dest_dir.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_output_rejected() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("empty.pdf");
        std::fs::write(&src, "").unwrap();
        let err = copy_output(&src, &tmp.path().join("out")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}

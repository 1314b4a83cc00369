//! Staging area for uploaded boundary files
//!
//! Uploads are copied under `<root>/<request-uuid>/` so the job that reads
//! them outlives the request that delivered them. Purging only ever touches
//! files that resolve inside the root.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::LayerResult;
use crate::geometry::BoundarySource;

static RE_UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._\-]+").expect("Invalid regex"));

/// Reduce an upload name to a safe file name
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = RE_UNSAFE_CHARS.replace_all(base, "_");
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Directory holding staged uploads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy uploads into a fresh request directory
    ///
    /// Returns the staged paths in upload order.
    pub async fn store(&self, uploads: &[BoundarySource]) -> LayerResult<Vec<PathBuf>> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        match Self::copy_uploads(&dir, uploads).await {
            Ok(staged) => {
                tracing::debug!(dir = %dir.display(), files = staged.len(), "Uploads staged");
                Ok(staged)
            }
            Err(e) => {
                // Nothing of a failed request stays behind.
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(dir = %dir.display(), error = %cleanup, "Failed to clean up staging");
                }
                Err(e)
            }
        }
    }

    async fn copy_uploads(dir: &Path, uploads: &[BoundarySource]) -> LayerResult<Vec<PathBuf>> {
        let mut staged = Vec::with_capacity(uploads.len());
        for (index, upload) in uploads.iter().enumerate() {
            let data = upload.read().await?;
            let path = dir.join(format!("{:04}_{}", index, sanitize_file_name(&upload.name())));
            tokio::fs::write(&path, &data).await?;
            staged.push(path);
        }
        Ok(staged)
    }

    /// Delete staged files and their emptied request directories
    ///
    /// Paths outside the root are refused with a warning. Returns how many
    /// files were removed.
    pub async fn purge(&self, paths: &[PathBuf]) -> usize {
        let root = match tokio::fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "Staging root unavailable");
                return 0;
            }
        };

        let mut removed = 0;
        let mut dirs: Vec<PathBuf> = Vec::new();
        for path in paths {
            let canonical = match tokio::fs::canonicalize(path).await {
                Ok(canonical) => canonical,
                Err(_) => continue,
            };
            if !canonical.starts_with(&root) || canonical == root {
                tracing::warn!(path = %path.display(), "Refusing to purge file outside staging root");
                continue;
            }
            match tokio::fs::remove_file(&canonical).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %canonical.display(), error = %e, "Failed to purge staged file");
                    continue;
                }
            }
            if let Some(parent) = canonical.parent()
                && parent != root
                && !dirs.iter().any(|d| d == parent)
            {
                dirs.push(parent.to_path_buf());
            }
        }

        for dir in dirs {
            // Fails while other files remain, which is fine.
            let _ = tokio::fs::remove_dir(&dir).await;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("límites 2024.kml"), "l_mites_2024.kml");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\tmp\\a.kml"), "a.kml");
        assert_eq!(sanitize_file_name("..."), "upload");
    }

    #[tokio::test]
    async fn test_store_then_purge() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let uploads = vec![
            BoundarySource::Bytes {
                name: "a.kml".into(),
                data: b"<kml/>".to_vec(),
            },
            BoundarySource::Bytes {
                name: "b c.kml".into(),
                data: b"<kml/>".to_vec(),
            },
        ];

        let staged = staging.store(&uploads).await.unwrap();
        assert_eq!(staged.len(), 2);
        assert!(staged[0].ends_with("0000_a.kml"));
        assert!(staged[1].ends_with("0001_b_c.kml"));
        let request_dir = staged[0].parent().unwrap().to_path_buf();
        assert!(request_dir.starts_with(dir.path()));

        assert_eq!(staging.purge(&staged).await, 2);
        assert!(!request_dir.exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_nothing_staged() {
        let dir = tempdir().unwrap();
        let staging = Staging::new(dir.path());
        let uploads = vec![
            BoundarySource::Bytes {
                name: "a.kml".into(),
                data: b"<kml/>".to_vec(),
            },
            BoundarySource::Path(dir.path().join("missing.kml")),
        ];

        assert!(staging.store(&uploads).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_purge_refuses_outside_root() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let victim = outside.path().join("keep.kml");
        std::fs::write(&victim, "x").unwrap();

        let staging = Staging::new(root.path());
        let sneaky = root.path().join("..").join(outside.path().file_name().unwrap()).join("keep.kml");
        assert_eq!(staging.purge(&[victim.clone(), sneaky]).await, 0);
        assert!(victim.exists());
    }
}

//! Read-only view of the extracted-frames tree.
//!
//! The tree is laid out as `<root>/<category>/<video>/<frame>`. Categories and
//! videos are directories; frames are image files filtered by extension.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading the media tree
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Enumerates categories, videos and frames. All listings are sorted
/// lexicographically.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    async fn list_categories(&self) -> Result<Vec<String>, CatalogError>;

    async fn list_videos(&self, category: &str) -> Result<Vec<String>, CatalogError>;

    async fn list_frames(&self, category: &str, video: &str) -> Result<Vec<String>, CatalogError>;
}

/// [`MediaCatalog`] over a local directory tree
pub struct FsMediaCatalog {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FsMediaCatalog {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_frame(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }

    /// Sorted entry names under `dir` whose file type satisfies `keep`
    async fn list_entries<F>(&self, dir: &Path, keep: F) -> Result<Vec<String>, CatalogError>
    where
        F: Fn(&std::fs::FileType, &str) -> bool,
    {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => CatalogError::NotFound(dir.display().to_string()),
            _ => CatalogError::Io {
                path: dir.to_path_buf(),
                source: e,
            },
        })?;

        let mut names = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|e| CatalogError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let Some(entry) = entry else { break };

            // Names that are not valid UTF-8 cannot be addressed through the API
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            // Follows symlinks so linked video directories are listed
            let file_type = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata.file_type(),
                Err(_) => continue,
            };

            if keep(&file_type, &name) {
                names.push(name);
            }
        }

        names.sort();
        debug!(dir = %dir.display(), count = names.len(), "Listed media directory");
        Ok(names)
    }
}

#[async_trait]
impl MediaCatalog for FsMediaCatalog {
    async fn list_categories(&self) -> Result<Vec<String>, CatalogError> {
        self.list_entries(&self.root, |ft, _| ft.is_dir()).await
    }

    async fn list_videos(&self, category: &str) -> Result<Vec<String>, CatalogError> {
        let dir = self.root.join(checked_name(category)?);
        self.list_entries(&dir, |ft, _| ft.is_dir()).await
    }

    async fn list_frames(&self, category: &str, video: &str) -> Result<Vec<String>, CatalogError> {
        let dir = self
            .root
            .join(checked_name(category)?)
            .join(checked_name(video)?);
        self.list_entries(&dir, |ft, name| ft.is_file() && self.is_frame(name))
            .await
    }
}

/// Reject anything that is not a single plain path component
pub fn checked_name(name: &str) -> Result<&str, CatalogError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        Err(CatalogError::InvalidName(name.to_string()))
    } else {
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn default_extensions() -> Vec<String> {
        vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("birds/vid_b")).unwrap();
        fs::create_dir_all(root.join("birds/vid_a")).unwrap();
        fs::create_dir_all(root.join("cats/vid_1")).unwrap();
        fs::write(root.join("README.txt"), "not a category").unwrap();
        fs::write(root.join("birds/notes.md"), "not a video").unwrap();

        for frame in ["frame_010.JPG", "frame_002.png", "frame_001.jpeg", "clip.mp4", "thumbs.db"] {
            fs::write(root.join("birds/vid_a").join(frame), b"x").unwrap();
        }
        fs::create_dir_all(root.join("birds/vid_a/nested.jpg")).unwrap();

        dir
    }

    #[tokio::test]
    async fn test_list_categories_directories_only() {
        let dir = fixture();
        let catalog = FsMediaCatalog::new(dir.path(), &default_extensions());

        assert_eq!(catalog.list_categories().await.unwrap(), vec!["birds", "cats"]);
    }

    #[tokio::test]
    async fn test_list_videos_sorted() {
        let dir = fixture();
        let catalog = FsMediaCatalog::new(dir.path(), &default_extensions());

        assert_eq!(catalog.list_videos("birds").await.unwrap(), vec!["vid_a", "vid_b"]);
    }

    #[tokio::test]
    async fn test_list_frames_filters_extensions_case_insensitively() {
        let dir = fixture();
        let catalog = FsMediaCatalog::new(dir.path(), &default_extensions());

        assert_eq!(
            catalog.list_frames("birds", "vid_a").await.unwrap(),
            vec!["frame_001.jpeg", "frame_002.png", "frame_010.JPG"]
        );
    }

    #[tokio::test]
    async fn test_missing_video_is_not_found() {
        let dir = fixture();
        let catalog = FsMediaCatalog::new(dir.path(), &default_extensions());

        assert!(matches!(
            catalog.list_frames("birds", "vid_z").await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let dir = fixture();
        let catalog = FsMediaCatalog::new(dir.path().join("birds"), &default_extensions());

        assert!(matches!(
            catalog.list_videos("..").await,
            Err(CatalogError::InvalidName(_))
        ));
        assert!(matches!(
            catalog.list_frames("vid_a/../..", "x").await,
            Err(CatalogError::InvalidName(_))
        ));
    }

    #[test]
    fn test_extensions_accept_leading_dot() {
        let catalog = FsMediaCatalog::new("/srv/frames", &[".PNG".to_string()]);
        assert!(catalog.is_frame("a.png"));
        assert!(!catalog.is_frame("a.jpg"));
        assert!(!catalog.is_frame("png"));
    }
}

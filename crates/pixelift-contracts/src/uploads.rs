use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use uuid::Uuid;

/// Directory of persisted result images, exposed to the page under
/// `/uploads/<file>`.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub file_name: String,
    pub path: PathBuf,
    pub public_path: String,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(&self, bytes: &[u8], extension: &str) -> Result<StoredUpload> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let extension = extension.trim_start_matches('.');
        let file_name = format!("{}.{}", Uuid::new_v4(), extension);
        let path = self.root.join(&file_name);
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(StoredUpload {
            public_path: format!("/uploads/{file_name}"),
            file_name,
            path,
        })
    }

    /// Reads a stored file back along with the media type the page should
    /// declare for it. The name must be a bare file name.
    pub fn open(&self, file_name: &str) -> Result<(Vec<u8>, &'static str)> {
        if file_name.is_empty() || file_name.contains(['/', '\\']) || file_name.starts_with('.') {
            bail!("invalid upload name '{file_name}'");
        }
        let path = self.root.join(file_name);
        let bytes =
            fs::read(&path).with_context(|| format!("upload '{file_name}' not found"))?;
        Ok((bytes, media_type_for_name(file_name)))
    }
}

/// The declared type is derived from the extension alone; stored results are
/// written as `.png` and legacy files fall back to JPEG.
pub fn media_type_for_name(file_name: &str) -> &'static str {
    if file_name.ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// Request-scoped copy of a processed upload in the OS temp dir.
///
/// The file is removed when the value drops, so every exit path of the
/// surrounding request cleans up after itself.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    pub fn create(bytes: &[u8], upload_name: &str) -> Result<Self> {
        let base = Path::new(upload_name)
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("upload");
        let path = env::temp_dir().join(format!("{}-{base}", Uuid::new_v4()));
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_open_round_trip() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = UploadStore::new(temp.path().join("uploads"));

        let stored = store.save(b"fake png bytes", "png")?;
        assert!(stored.path.is_file());
        assert!(stored.file_name.ends_with(".png"));
        assert_eq!(stored.public_path, format!("/uploads/{}", stored.file_name));

        let (bytes, media_type) = store.open(&stored.file_name)?;
        assert_eq!(bytes, b"fake png bytes");
        assert_eq!(media_type, "image/png");
        Ok(())
    }

    #[test]
    fn media_type_falls_back_to_jpeg() {
        assert_eq!(media_type_for_name("a.png"), "image/png");
        assert_eq!(media_type_for_name("a.jpg"), "image/jpeg");
        assert_eq!(media_type_for_name("a.webp"), "image/jpeg");
    }

    #[test]
    fn open_rejects_missing_and_unsafe_names() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = UploadStore::new(temp.path().join("uploads"));

        assert!(store.open("missing.png").is_err());
        assert!(store.open("../escape.png").is_err());
        assert!(store.open("nested/escape.png").is_err());
        assert!(store.open("").is_err());
        Ok(())
    }

    #[test]
    fn temp_upload_is_removed_on_drop() -> Result<()> {
        let temp = TempUpload::create(b"resized", "photo.webp")?;
        let path = temp.path().to_path_buf();
        assert!(path.is_file());
        drop(temp);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn temp_upload_strips_directories_from_the_name() -> Result<()> {
        let temp = TempUpload::create(b"resized", "/tmp/deep/photo.webp")?;
        let name = temp
            .path()
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .to_string();
        assert!(name.ends_with("-photo.webp"));
        assert!(!name.contains('/'));
        Ok(())
    }
}

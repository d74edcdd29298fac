//! On-disk dataset layout.
//!
//! ```text
//! <base>/
//!     <dataset>/
//!         images/            source imagery
//!         segmentations/     rendered label maps, created on demand
//!         metadata.json
//! ```

use std::path::{Path, PathBuf};

use crate::metadata::MetadataStore;

/// Directory holding a dataset's source images.
pub const IMAGES_DIR: &str = "images";

/// Directory holding a dataset's rendered label maps.
pub const SEGMENTATIONS_DIR: &str = "segmentations";

/// A dataset's metadata document.
pub const METADATA_FILE: &str = "metadata.json";

/// Source image extensions, matched case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Default directory holding all datasets.
pub const DEFAULT_BASE_DIR: &str = "Microclimate Analysis Data";

/// Errors that can occur while reading a dataset's layout.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// The dataset directory does not exist.
    #[error("dataset not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError {
    let path = path.to_path_buf();
    move |source| DatasetError::Io { path, source }
}

/// One dataset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    /// Open the dataset rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::NotFound`] if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(DatasetError::NotFound(root));
        }
        Ok(Self { root })
    }

    /// Dataset root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder name of the dataset.
    #[must_use]
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map_or_else(|| self.root.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    #[must_use]
    pub fn segmentations_dir(&self) -> PathBuf {
        self.root.join(SEGMENTATIONS_DIR)
    }

    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// The store owning this dataset's metadata document.
    #[must_use]
    pub fn metadata_store(&self) -> MetadataStore {
        MetadataStore::new(self.metadata_path())
    }

    /// Source images in file-name order.
    ///
    /// A dataset without an images directory has no images.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Io`] if the directory cannot be listed.
    pub fn image_paths(&self) -> Result<Vec<PathBuf>, DatasetError> {
        let dir = self.images_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.is_file() && is_image(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Where the rendered map of `image` is written.
    #[must_use]
    pub fn segmentation_path(&self, image: &Path) -> PathBuf {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.segmentations_dir()
            .join(microclimate_export::segmentation_file_name(&stem))
    }

    /// Write the rendered map of `image`, creating the segmentations
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Io`] if the directory or file cannot be
    /// written.
    pub fn write_segmentation(&self, image: &Path, png: &[u8]) -> Result<PathBuf, DatasetError> {
        let dir = self.segmentations_dir();
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let path = self.segmentation_path(image);
        std::fs::write(&path, png).map_err(io_error(&path))?;
        Ok(path)
    }
}

/// Whether `path` has one of [`IMAGE_EXTENSIONS`].
#[must_use]
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// The directory holding every dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCatalog {
    base: PathBuf,
}

impl DatasetCatalog {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Names of the dataset folders, sorted.
    ///
    /// A missing base directory holds no datasets.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Io`] if the base directory cannot be listed.
    pub fn datasets(&self) -> Result<Vec<String>, DatasetError> {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.base)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.base))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Open the dataset named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::NotFound`] if there is no such folder.
    pub fn dataset(&self, name: &str) -> Result<Dataset, DatasetError> {
        Dataset::open(self.base.join(name))
    }
}

impl Default for DatasetCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn open_rejects_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let result = Dataset::open(tmp.path().join("nope"));
        assert!(matches!(result, Err(DatasetError::NotFound(_))));
    }

    #[test]
    fn image_paths_filter_and_sort() {
        let tmp = tempfile::tempdir().unwrap();
        let images = tmp.path().join(IMAGES_DIR);
        for name in ["b.PNG", "a.jpg", "c.tiff", "notes.txt", "d"] {
            touch(&images.join(name));
        }
        std::fs::create_dir_all(images.join("nested.png")).unwrap();

        let dataset = Dataset::open(tmp.path()).unwrap();
        let names: Vec<_> = dataset
            .image_paths()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.tiff"]);
    }

    #[test]
    fn missing_images_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = Dataset::open(tmp.path()).unwrap();
        assert!(dataset.image_paths().unwrap().is_empty());
    }

    #[test]
    fn segmentation_is_written_beside_images() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = Dataset::open(tmp.path()).unwrap();
        let image = dataset.images_dir().join("site_2019.jpg");
        let written = dataset.write_segmentation(&image, b"png").unwrap();
        assert_eq!(
            written,
            tmp.path().join(SEGMENTATIONS_DIR).join("site_2019_seg.png")
        );
        assert_eq!(std::fs::read(written).unwrap(), b"png");
    }

    #[test]
    fn catalog_lists_directories_only() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("orchard")).unwrap();
        std::fs::create_dir(tmp.path().join("harbor")).unwrap();
        touch(&tmp.path().join("readme.txt"));

        let catalog = DatasetCatalog::new(tmp.path());
        assert_eq!(catalog.datasets().unwrap(), vec!["harbor", "orchard"]);
        assert_eq!(catalog.dataset("harbor").unwrap().name(), "harbor");
    }

    #[test]
    fn missing_catalog_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = DatasetCatalog::new(tmp.path().join("absent"));
        assert!(catalog.datasets().unwrap().is_empty());
    }
}

//! Image Staging
//!
//! Manages the `input`, `resized` and `output` working directories. Every
//! request gets its own namespace inside each of them, so one request's
//! cleanup never touches files another request is still using.

use image::imageops::FilterType;
use image::ImageReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Names of the managed directories, in cleanup order
pub const MANAGED_DIRS: [&str; 3] = ["input", "output", "resized"];

/// Filename used when the client-supplied one is unusable
const FALLBACK_FILENAME: &str = "upload";

/// Errors raised while staging request images
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("uploaded file is not a decodable image: {0}")]
    UndecodableImage(#[source] image::ImageError),
    #[error("failed to write image {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Root of the shared working directories
#[derive(Debug, Clone)]
pub struct StagingArea {
    input: PathBuf,
    resized: PathBuf,
    output: PathBuf,
}

impl StagingArea {
    /// Create the managed directories under `root`
    pub fn new(root: &Path) -> Result<Self, StagingError> {
        let [input, output, resized] = MANAGED_DIRS.map(|name| root.join(name));
        let area = Self {
            input,
            resized,
            output,
        };

        for dir in area.managed_dirs() {
            std::fs::create_dir_all(dir).map_err(|e| StagingError::io(dir, e))?;
        }

        Ok(area)
    }

    /// All managed directories
    pub fn managed_dirs(&self) -> [&Path; 3] {
        [&self.input, &self.output, &self.resized]
    }

    /// Open a fresh request-scoped namespace in every managed directory
    pub fn begin(&self) -> Result<RequestStaging, StagingError> {
        let request_id = Uuid::new_v4().simple().to_string();

        let staging = RequestStaging {
            input: self.input.join(&request_id),
            resized: self.resized.join(&request_id),
            output: self.output.join(&request_id),
            request_id,
            cleaned: false,
        };

        for dir in staging.dirs() {
            std::fs::create_dir_all(dir).map_err(|e| StagingError::io(dir, e))?;
        }

        debug!("Opened staging namespace {}", staging.request_id);
        Ok(staging)
    }
}

/// Staged files of a single request
///
/// Dropping the handle reclaims every file it staged.
#[derive(Debug)]
pub struct RequestStaging {
    request_id: String,
    input: PathBuf,
    resized: PathBuf,
    output: PathBuf,
    cleaned: bool,
}

impl RequestStaging {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Directory for per-detection crops
    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    fn dirs(&self) -> [&Path; 3] {
        [&self.input, &self.output, &self.resized]
    }

    /// Write uploaded bytes verbatim into the input namespace
    pub fn stage(&self, bytes: &[u8], filename: &str) -> Result<PathBuf, StagingError> {
        let path = self.input.join(sanitize_filename(filename));
        std::fs::write(&path, bytes).map_err(|e| StagingError::io(&path, e))?;

        debug!("Staged {} bytes at {:?}", bytes.len(), path);
        Ok(path)
    }

    /// Resample an image to a `target_size` square and store it as JPEG
    ///
    /// The format is sniffed from the file contents, so the upload's
    /// extension does not matter. The aspect ratio is not preserved.
    pub fn resize(&self, path: &Path, target_size: u32) -> Result<PathBuf, StagingError> {
        let img = ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| StagingError::io(path, e))?
            .decode()
            .map_err(StagingError::UndecodableImage)?;
        let resized = img
            .resize_exact(target_size, target_size, FilterType::Lanczos3)
            .to_rgb8();

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_FILENAME);
        let output_path = self.resized.join(format!("{stem}.jpg"));

        resized
            .save_with_format(&output_path, image::ImageFormat::Jpeg)
            .map_err(|e| StagingError::Encode {
                path: output_path.clone(),
                source: e,
            })?;

        Ok(output_path)
    }

    /// Delete every staged file, then the namespace directories
    ///
    /// Failures are logged and do not stop the remaining deletions.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        let mut removed = 0usize;
        for dir in self.dirs() {
            removed += clean_directory(dir);
            if let Err(e) = std::fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove staging directory {:?}: {}", dir, e);
                }
            }
        }

        debug!(
            "Cleaned staging namespace {} ({} files)",
            self.request_id, removed
        );
    }
}

impl Drop for RequestStaging {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Unlink every regular file and symlink in `dir`, returning how many went
fn clean_directory(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to list {:?}: {}", dir, e);
            }
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_file_or_link = entry
            .file_type()
            .map(|t| t.is_file() || t.is_symlink())
            .unwrap_or(false);
        if !is_file_or_link {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to delete {:?}: {}", path, e),
        }
    }

    removed
}

/// Reduce a client filename to a safe single path component
pub fn sanitize_filename(filename: &str) -> String {
    let last = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\pic 1.png"), "pic_1.png");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir/"), "upload");
        assert_eq!(sanitize_filename("flasche-ä.jpg"), "flasche-_.jpg");
    }

    #[test]
    fn test_new_creates_managed_dirs() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();

        for dir in area.managed_dirs() {
            assert!(dir.is_dir());
        }
    }

    #[test]
    fn test_stage_and_resize() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();
        let staging = area.begin().unwrap();

        let input = staging.stage(&png_bytes(300, 120), "bottle.png").unwrap();
        assert!(input.starts_with(root.path().join("input")));
        assert_eq!(std::fs::read(&input).unwrap(), png_bytes(300, 120));

        let resized = staging.resize(&input, 640).unwrap();
        assert_eq!(resized.file_name().unwrap(), "bottle.jpg");
        let img = image::open(&resized).unwrap();
        assert_eq!((img.width(), img.height()), (640, 640));
    }

    #[test]
    fn test_resize_ignores_extension() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();
        let staging = area.begin().unwrap();

        for name in ["photo.jpg", "blob", ""] {
            let input = staging.stage(&png_bytes(30, 20), name).unwrap();
            let resized = staging.resize(&input, 64).unwrap();
            let img = image::open(&resized).unwrap();
            assert_eq!((img.width(), img.height()), (64, 64), "{name:?}");
        }
    }

    #[test]
    fn test_resize_rejects_non_image() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();
        let staging = area.begin().unwrap();

        let input = staging.stage(b"definitely not an image", "x.jpg").unwrap();
        let result = staging.resize(&input, 640);
        assert!(matches!(result, Err(StagingError::UndecodableImage(_))));
    }

    #[test]
    fn test_cleanup_empties_managed_dirs() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();
        let mut staging = area.begin().unwrap();

        let input = staging.stage(&png_bytes(10, 10), "a.png").unwrap();
        staging.resize(&input, 32).unwrap();
        std::fs::write(staging.output_dir().join("crop.jpg"), b"x").unwrap();

        staging.cleanup();

        for dir in area.managed_dirs() {
            assert!(is_empty_dir(dir), "{:?} not empty", dir);
        }
    }

    #[test]
    fn test_drop_reclaims_files() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();

        {
            let staging = area.begin().unwrap();
            staging.stage(b"bytes", "a.jpg").unwrap();
        }

        for dir in area.managed_dirs() {
            assert!(is_empty_dir(dir));
        }
    }

    #[test]
    fn test_cleanup_leaves_other_requests_alone() {
        let root = TempDir::new().unwrap();
        let area = StagingArea::new(root.path()).unwrap();

        let mut first = area.begin().unwrap();
        let second = area.begin().unwrap();
        assert_ne!(first.request_id(), second.request_id());

        first.stage(b"one", "same.jpg").unwrap();
        let kept = second.stage(b"two", "same.jpg").unwrap();

        first.cleanup();

        assert_eq!(std::fs::read(&kept).unwrap(), b"two");
    }
}

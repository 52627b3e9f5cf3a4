use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Shared flag checked between units of work.
pub type CancellationToken = Arc<AtomicBool>;

pub fn new_cancellation_token() -> CancellationToken {
    Arc::new(AtomicBool::new(false))
}

/// Enumerates image files under a folder.
pub struct ScannerService {
    supported_formats: HashSet<String>,
}

impl ScannerService {
    pub fn new(formats: &[String]) -> Self {
        Self {
            supported_formats: formats
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// Supported files under `root`, sorted by file name and then path.
    pub fn discover_files(
        &self,
        root: &Path,
        recursive: bool,
        cancellation_token: &CancellationToken,
    ) -> Result<Vec<PathBuf>, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            });
        }

        let walker = if recursive {
            WalkDir::new(root)
        } else {
            WalkDir::new(root).max_depth(1)
        };

        let mut discovered_files = Vec::new();
        for entry in walker.follow_links(false) {
            if cancellation_token.load(Ordering::Relaxed) {
                return Err(ScanError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            if entry.file_type().is_file() && self.is_supported_format(entry.path()) {
                discovered_files.push(entry.into_path());
            }
        }

        discovered_files.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
        Ok(discovered_files)
    }

    pub fn is_supported_format(&self, file_path: &Path) -> bool {
        match file_path.extension() {
            Some(extension) => {
                let ext = extension.to_string_lossy().to_lowercase();
                self.supported_formats.contains(&ext)
            }
            None => false,
        }
    }

    pub fn supported_formats(&self) -> &HashSet<String> {
        &self.supported_formats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scanner() -> ScannerService {
        ScannerService::new(&["jpg".to_string(), ".PNG".to_string()])
    }

    #[test]
    fn test_supported_format_detection() {
        let scanner = scanner();
        assert!(scanner.is_supported_format(Path::new("test.jpg")));
        assert!(scanner.is_supported_format(Path::new("test.JPG")));
        assert!(scanner.is_supported_format(Path::new("test.png")));
        assert!(!scanner.is_supported_format(Path::new("test.txt")));
        assert!(!scanner.is_supported_format(Path::new("test")));
    }

    #[test]
    fn test_file_type_filtering_and_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("b.jpg"), b"x").unwrap();
        fs::write(temp_dir.path().join("a.png"), b"x").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        let files = scanner()
            .discover_files(temp_dir.path(), true, &new_cancellation_token())
            .unwrap();

        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.png", "b.jpg"]);
    }

    #[test]
    fn test_recursive_flag() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(temp_dir.path().join("top.jpg"), b"x").unwrap();
        fs::write(nested.join("deep.jpg"), b"x").unwrap();

        let token = new_cancellation_token();
        let flat = scanner()
            .discover_files(temp_dir.path(), false, &token)
            .unwrap();
        let deep = scanner()
            .discover_files(temp_dir.path(), true, &token)
            .unwrap();

        assert_eq!(flat.len(), 1);
        assert_eq!(deep.len(), 2);
    }

    #[test]
    fn test_empty_and_invalid_directories() {
        let temp_dir = TempDir::new().unwrap();
        let token = new_cancellation_token();

        assert!(scanner()
            .discover_files(temp_dir.path(), true, &token)
            .unwrap()
            .is_empty());
        assert!(matches!(
            scanner().discover_files(&temp_dir.path().join("missing"), true, &token),
            Err(ScanError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_cancellation() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.jpg"), b"x").unwrap();

        let token = new_cancellation_token();
        token.store(true, Ordering::Relaxed);

        assert!(matches!(
            scanner().discover_files(temp_dir.path(), true, &token),
            Err(ScanError::Cancelled)
        ));
    }
}

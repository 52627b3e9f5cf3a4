use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// 100ns intervals between 1601-01-01 and the Unix epoch.
const FILE_TIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

/// Size and modification time of a file, read once from the file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: SystemTime,
}

impl FileStamp {
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }

    /// Modification time as 100ns ticks since 1601-01-01 (Windows file time).
    pub fn file_time(&self) -> i64 {
        to_file_time(self.modified)
    }
}

pub fn to_file_time(time: SystemTime) -> i64 {
    let ticks = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_nanos() / 100) as i64,
        Err(before) => -((before.duration().as_nanos() / 100) as i64),
    };
    FILE_TIME_UNIX_OFFSET + ticks
}

/// One scanned image and whatever features have been computed for it.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub last_modified: SystemTime,
    /// L2-normalized; present only when deep extraction succeeded.
    pub embedding: Option<Vec<f32>>,
    pub hash: Option<u64>,
    pub thumbnail: Option<Arc<DynamicImage>>,
    /// Only meaningful on records returned from a search.
    pub similarity: f32,
}

impl ImageRecord {
    pub fn new(path: PathBuf, stamp: FileStamp) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        Self {
            path,
            file_name,
            file_size: stamp.size,
            last_modified: stamp.modified,
            embedding: None,
            hash: None,
            thumbnail: None,
            similarity: 0.0,
        }
    }

    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            size: self.file_size,
            modified: self.last_modified,
        }
    }

    pub fn has_features(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty()) || self.hash.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_file_time_encoding() {
        let time = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_700);
        assert_eq!(
            to_file_time(time),
            FILE_TIME_UNIX_OFFSET + 17_000_000_001_234_567
        );
        assert_eq!(to_file_time(UNIX_EPOCH), FILE_TIME_UNIX_OFFSET);
    }

    #[test]
    fn test_probe_reads_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("photo.jpg");
        fs::write(&path, b"12345").unwrap();

        let stamp = FileStamp::probe(&path).unwrap();
        assert_eq!(stamp.size, 5);
        assert!(FileStamp::probe(&temp_dir.path().join("gone.jpg")).is_err());
    }

    #[test]
    fn test_record_construction_is_pure() {
        let stamp = FileStamp {
            size: 42,
            modified: UNIX_EPOCH,
        };
        let record = ImageRecord::new(PathBuf::from("/nowhere/holiday.png"), stamp);

        assert_eq!(record.file_name, "holiday.png");
        assert_eq!(record.stamp(), stamp);
        assert!(!record.has_features());
    }

    #[test]
    fn test_has_features() {
        let stamp = FileStamp {
            size: 1,
            modified: UNIX_EPOCH,
        };
        let mut record = ImageRecord::new(PathBuf::from("a.png"), stamp);

        record.embedding = Some(Vec::new());
        assert!(!record.has_features());

        record.hash = Some(0);
        assert!(record.has_features());

        record.hash = None;
        record.embedding = Some(vec![1.0]);
        assert!(record.has_features());
    }
}

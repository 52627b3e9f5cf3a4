use super::models::{bytes_to_embedding, embedding_to_bytes, CacheEntry, CacheStatistics};
use super::{cache_path_for, open_database, CacheError};
use crate::core::image::FileStamp;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Per-folder persistent embedding cache.
///
/// One connection per instance; every operation takes the connection lock,
/// so the instance can be shared between tasks.
pub struct FeatureCache {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl FeatureCache {
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        let conn = open_database(db_path)?;
        log::debug!("Opened feature cache {}", db_path.display());
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_for_folder(root: &Path) -> Result<Self, CacheError> {
        Self::open(&cache_path_for(root))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Cached embedding for `path`, if its size and modification time still
    /// match the file on disk.
    pub fn lookup(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let stamp = match FileStamp::probe(path) {
            Ok(stamp) => stamp,
            Err(_) => return Ok(None),
        };
        self.lookup_with_stamp(path, &stamp)
    }

    pub fn lookup_with_stamp(
        &self,
        path: &Path,
        stamp: &FileStamp,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let key = path_key(path);
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT file_size, last_modified, embedding, embedding_len, created_at, updated_at
                 FROM feature_cache WHERE path = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((file_size, last_modified, blob, len, created_at, updated_at)) = row else {
            return Ok(None);
        };

        if file_size as u64 != stamp.size || last_modified != stamp.file_time() {
            return Ok(None);
        }

        let embedding = bytes_to_embedding(&blob, len.max(0) as usize).ok_or_else(|| {
            CacheError::CorruptEntry {
                path: key.clone(),
                message: format!("{} bytes for {} floats", blob.len(), len),
            }
        })?;

        Ok(Some(CacheEntry {
            path: key,
            file_size: file_size as u64,
            last_modified,
            embedding,
            created_at,
            updated_at,
        }))
    }

    /// Insert or replace the embedding for `path`, stamped with the file's
    /// current size and modification time.
    pub fn store(&self, path: &Path, embedding: &[f32]) -> Result<(), CacheError> {
        let stamp = FileStamp::probe(path)?;
        self.store_with_stamp(path, &stamp, embedding)
    }

    pub fn store_with_stamp(
        &self,
        path: &Path,
        stamp: &FileStamp,
        embedding: &[f32],
    ) -> Result<(), CacheError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO feature_cache
                 (path, file_size, last_modified, embedding, embedding_len, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(path) DO UPDATE SET
                 file_size = excluded.file_size,
                 last_modified = excluded.last_modified,
                 embedding = excluded.embedding,
                 embedding_len = excluded.embedding_len,
                 updated_at = excluded.updated_at",
            params![
                path_key(path),
                stamp.size as i64,
                stamp.file_time(),
                embedding_to_bytes(embedding),
                embedding.len() as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, path: &Path) -> Result<bool, CacheError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM feature_cache WHERE path = ?1",
            params![path_key(path)],
        )?;
        Ok(removed > 0)
    }

    /// Delete entries whose file no longer exists. Returns how many went.
    pub fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let keys: Vec<String> = {
            let mut stmt = tx.prepare("SELECT path FROM feature_cache")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut removed = 0;
        for key in keys.iter().filter(|key| !Path::new(key.as_str()).exists()) {
            removed += tx.execute("DELETE FROM feature_cache WHERE path = ?1", params![key])?;
        }
        tx.commit()?;

        log::info!(
            "Removed {} expired entries from {}",
            removed,
            self.db_path.display()
        );
        Ok(removed)
    }

    /// Delete every entry.
    pub fn reset(&self) -> Result<usize, CacheError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM feature_cache", [])?;
        conn.execute_batch("VACUUM")?;
        Ok(removed)
    }

    pub fn statistics(&self) -> Result<CacheStatistics, CacheError> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM feature_cache", [], |row| row.get(0))?;
        let database_bytes = fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        Ok(CacheStatistics {
            total_entries: total as u64,
            database_bytes,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }
}

fn path_key(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    };
    absolute.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn setup() -> (TempDir, FeatureCache) {
        let temp_dir = TempDir::new().unwrap();
        let cache = FeatureCache::open_for_folder(temp_dir.path()).unwrap();
        (temp_dir, cache)
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_round_trip() {
        let (temp_dir, cache) = setup();
        let path = write_file(temp_dir.path(), "a.jpg", b"image bytes");
        let embedding = vec![0.5f32, -0.25, 1.0e-7, 0.0, 3.5];

        cache.store(&path, &embedding).unwrap();
        let entry = cache.lookup(&path).unwrap().unwrap();

        assert_eq!(entry.embedding, embedding);
        assert_eq!(entry.file_size, 11);
        assert_eq!(entry.created_at, entry.updated_at);
    }

    #[test]
    fn test_miss_for_unknown_and_missing_files() {
        let (temp_dir, cache) = setup();
        let path = write_file(temp_dir.path(), "a.jpg", b"x");

        assert!(cache.lookup(&path).unwrap().is_none());
        assert!(cache.lookup(&temp_dir.path().join("gone.jpg")).unwrap().is_none());
    }

    #[test]
    fn test_size_change_invalidates() {
        let (temp_dir, cache) = setup();
        let path = write_file(temp_dir.path(), "a.jpg", b"original");
        cache.store(&path, &[1.0, 0.0]).unwrap();

        fs::write(&path, b"original plus more").unwrap();
        assert!(cache.lookup(&path).unwrap().is_none());
    }

    #[test]
    fn test_mtime_change_invalidates() {
        let (temp_dir, cache) = setup();
        let path = write_file(temp_dir.path(), "a.jpg", b"original");
        cache.store(&path, &[1.0, 0.0]).unwrap();

        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(3600))
            .unwrap();
        drop(file);

        assert!(cache.lookup(&path).unwrap().is_none());
    }

    #[test]
    fn test_store_overwrites_and_keeps_created_at() {
        let (temp_dir, cache) = setup();
        let path = write_file(temp_dir.path(), "a.jpg", b"x");

        cache.store(&path, &[1.0]).unwrap();
        let first = cache.lookup(&path).unwrap().unwrap();
        cache.store(&path, &[0.0, 1.0]).unwrap();
        let second = cache.lookup(&path).unwrap().unwrap();

        assert_eq!(second.embedding, vec![0.0, 1.0]);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(cache.statistics().unwrap().total_entries, 1);
    }

    #[test]
    fn test_cleanup_removes_only_missing_files() {
        let (temp_dir, cache) = setup();
        let keep = write_file(temp_dir.path(), "keep.jpg", b"k");
        let drop_a = write_file(temp_dir.path(), "drop_a.jpg", b"a");
        let drop_b = write_file(temp_dir.path(), "drop_b.jpg", b"b");
        for path in [&keep, &drop_a, &drop_b] {
            cache.store(path, &[1.0, 2.0]).unwrap();
        }

        fs::remove_file(&drop_a).unwrap();
        fs::remove_file(&drop_b).unwrap();

        assert_eq!(cache.cleanup_expired().unwrap(), 2);
        assert_eq!(cache.cleanup_expired().unwrap(), 0);
        assert_eq!(cache.statistics().unwrap().total_entries, 1);
        assert_eq!(cache.lookup(&keep).unwrap().unwrap().embedding, vec![1.0, 2.0]);
    }

    #[test]
    fn test_remove_and_reset() {
        let (temp_dir, cache) = setup();
        let a = write_file(temp_dir.path(), "a.jpg", b"a");
        let b = write_file(temp_dir.path(), "b.jpg", b"b");
        cache.store(&a, &[1.0]).unwrap();
        cache.store(&b, &[1.0]).unwrap();

        assert!(cache.remove(&a).unwrap());
        assert!(!cache.remove(&a).unwrap());
        assert_eq!(cache.reset().unwrap(), 1);
        assert_eq!(cache.statistics().unwrap().total_entries, 0);
    }

    #[test]
    fn test_corrupt_blob_is_reported() {
        let (temp_dir, cache) = setup();
        let path = write_file(temp_dir.path(), "a.jpg", b"x");
        cache.store(&path, &[1.0, 2.0]).unwrap();

        cache
            .lock()
            .unwrap()
            .execute("UPDATE feature_cache SET embedding_len = 3", [])
            .unwrap();

        assert!(matches!(
            cache.lookup(&path),
            Err(CacheError::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(temp_dir.path(), "a.jpg", b"x");

        {
            let cache = FeatureCache::open_for_folder(temp_dir.path()).unwrap();
            cache.store(&path, &[0.25, 0.75]).unwrap();
        }

        let cache = FeatureCache::open_for_folder(temp_dir.path()).unwrap();
        assert_eq!(
            cache.lookup(&path).unwrap().unwrap().embedding,
            vec![0.25, 0.75]
        );
    }
}

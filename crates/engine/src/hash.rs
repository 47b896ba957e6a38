//! Content fingerprints (lowercase hex SHA-256).

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use cache::{repository::files, CachePool};

use crate::EngineError;

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Fingerprint a file by streaming its contents.
pub async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of an ordered list of `(kind, name, fingerprint)` parts.
///
/// Callers must pass the parts in a deterministic order.
pub fn combine<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (kind, name, fingerprint) in parts {
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// Memoized file fingerprints.
///
/// Paths are keyed as written in the plan and resolved against the project
/// root. A file is only re-read when its size or modification time differs
/// from what the cache recorded.
#[derive(Debug, Clone)]
pub struct FileHasher {
    pool: CachePool,
    root: PathBuf,
}

impl FileHasher {
    pub fn new(pool: CachePool, root: impl Into<PathBuf>) -> Self {
        Self { pool, root: root.into() }
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Current fingerprint of `path`, `None` if the file does not exist.
    pub async fn fingerprint(&self, path: &str) -> Result<Option<String>, EngineError> {
        let full = self.resolve(path);
        let meta = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                files::delete_file(&self.pool, path).await?;
                return Ok(None);
            }
            Err(e) => return Err(EngineError::io(full, e)),
        };

        let size = meta.len() as i64;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        if let Some(rec) = files::get_file(&self.pool, path).await? {
            if rec.size == size && rec.mtime_ns == mtime_ns {
                return Ok(Some(rec.hash));
            }
        }

        debug!(path, "hashing file");
        let hash = hash_file(&full).await.map_err(|e| EngineError::io(&full, e))?;
        files::upsert_file(&self.pool, path, &hash, size, mtime_ns).await?;
        Ok(Some(hash))
    }

    /// Combined fingerprint of several files; a missing file contributes
    /// the marker `missing`, so creating or deleting it changes the result.
    pub async fn fingerprint_all<'a, I>(&self, paths: I) -> Result<String, EngineError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut parts = Vec::new();
        for path in paths {
            let fp = self.fingerprint(path).await?;
            parts.push((path.clone(), fp.unwrap_or_else(|| "missing".to_owned())));
        }
        Ok(combine(parts.iter().map(|(p, h)| ("file", p.as_str(), h.as_str()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::pool::open_in_memory;

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            hash_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn combine_depends_on_every_part_and_order() {
        let a = combine([("target", "x", "1"), ("import", "y", "2")]);
        let b = combine([("import", "y", "2"), ("target", "x", "1")]);
        let c = combine([("target", "x", "1"), ("import", "y", "3")]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, combine([("target", "x", "1"), ("import", "y", "2")]));
        // Separators keep ("ab", "c") and ("a", "bc") apart.
        assert_ne!(combine([("t", "ab", "c")]), combine([("t", "a", "bc")]));
    }

    #[tokio::test]
    async fn hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"some content").unwrap();
        assert_eq!(hash_file(&path).await.unwrap(), hash_bytes(b"some content"));
    }

    #[tokio::test]
    async fn file_hasher_tracks_changes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in_memory().await.unwrap();
        let hasher = FileHasher::new(pool.clone(), dir.path());

        assert_eq!(hasher.fingerprint("data.csv").await.unwrap(), None);

        std::fs::write(dir.path().join("data.csv"), "a,b\n").unwrap();
        let first = hasher.fingerprint("data.csv").await.unwrap().unwrap();
        assert_eq!(first, hash_str("a,b\n"));
        assert!(files::get_file(&pool, "data.csv").await.unwrap().is_some());

        std::fs::write(dir.path().join("data.csv"), "a,b\n1,2\n").unwrap();
        let second = hasher.fingerprint("data.csv").await.unwrap().unwrap();
        assert_ne!(first, second);

        std::fs::remove_file(dir.path().join("data.csv")).unwrap();
        assert_eq!(hasher.fingerprint("data.csv").await.unwrap(), None);
        assert!(files::get_file(&pool, "data.csv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_metadata_reuses_memo() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in_memory().await.unwrap();
        let hasher = FileHasher::new(pool.clone(), dir.path());
        std::fs::write(dir.path().join("f"), "x").unwrap();
        hasher.fingerprint("f").await.unwrap();

        // Forge the memo: same size/mtime but a different hash is trusted.
        let rec = files::get_file(&pool, "f").await.unwrap().unwrap();
        files::upsert_file(&pool, "f", "forged", rec.size, rec.mtime_ns).await.unwrap();
        assert_eq!(hasher.fingerprint("f").await.unwrap().as_deref(), Some("forged"));
    }

    #[tokio::test]
    async fn fingerprint_all_notices_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in_memory().await.unwrap();
        let hasher = FileHasher::new(pool, dir.path());
        let paths = vec!["out.txt".to_string()];

        let before = hasher.fingerprint_all(&paths).await.unwrap();
        std::fs::write(dir.path().join("out.txt"), "").unwrap();
        let after = hasher.fingerprint_all(&paths).await.unwrap();
        assert_ne!(before, after);
    }
}

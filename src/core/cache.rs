//! 指纹缓存
//!
//! 保存每个已上传条目的校验和，避免每次同步都重新计算。缓存文件是 gzip
//! 压缩的 JSON，写入时先写临时文件再重命名，磁盘上的文件要么是旧的完整
//! 版本，要么是新的完整版本。

use crate::core::file_state::FingerprintRecord;
use crate::error::CacheError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 缓存文件格式版本
pub const CACHE_VERSION: u32 = 1;

/// 内存中的指纹缓存
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintCache {
    session_id: String,
    entries: BTreeMap<String, FingerprintRecord>,
}

impl FingerprintCache {
    /// 新的空缓存，生成新的 session id
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn get(&self, path: &str) -> Option<&FingerprintRecord> {
        self.entries.get(path)
    }

    /// 整条记录替换，只在远程确认写入后调用
    pub fn insert(&mut self, path: impl Into<String>, record: FingerprintRecord) {
        self.entries.insert(path.into(), record);
    }

    pub fn entries(&self) -> &BTreeMap<String, FingerprintRecord> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    session_id: &'a str,
    entries: &'a BTreeMap<String, FingerprintRecord>,
}

#[derive(Deserialize)]
struct CacheFile {
    version: u32,
    session_id: String,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

/// 指纹缓存文件
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    path: PathBuf,
}

impl FingerprintStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// 加载缓存；文件不存在、损坏或格式不符时返回新的空缓存
    pub fn load(&self) -> FingerprintCache {
        match self.try_load() {
            Ok(cache) => {
                info!(
                    "已加载缓存 {:?}: {} 条记录 (session {})",
                    self.path,
                    cache.len(),
                    cache.session_id()
                );
                cache
            }
            Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                info!("缓存文件不存在，将重新计算校验和: {:?}", self.path);
                FingerprintCache::new()
            }
            Err(e) => {
                warn!("缓存文件无效，忽略并使用空缓存 {:?}: {}", self.path, e);
                FingerprintCache::new()
            }
        }
    }

    /// 严格加载；单条记录格式错误只丢弃该条
    pub fn try_load(&self) -> Result<FingerprintCache, CacheError> {
        let file = File::open(&self.path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let raw: CacheFile = serde_json::from_reader(decoder)?;

        if raw.version != CACHE_VERSION {
            return Err(CacheError::Format(format!("version {}", raw.version)));
        }
        if raw.session_id.trim().is_empty() {
            return Err(CacheError::Format("empty session id".to_string()));
        }

        let mut entries = BTreeMap::new();
        for (path, value) in raw.entries {
            match serde_json::from_value::<FingerprintRecord>(value) {
                Ok(record) => {
                    entries.insert(path, record);
                }
                Err(e) => debug!("丢弃无效缓存记录 {}: {}", path, e),
            }
        }

        Ok(FingerprintCache {
            session_id: raw.session_id,
            entries,
        })
    }

    /// 原子写入：临时文件 + fsync + 重命名
    pub fn save(&self, cache: &FingerprintCache) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.temp_path();
        if let Err(e) = self.write_file(&temp_path, cache) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, &self.path)?;

        debug!("已保存 {} 条缓存记录到 {:?}", cache.len(), self.path);
        Ok(())
    }

    fn write_file(&self, temp_path: &Path, cache: &FingerprintCache) -> Result<(), CacheError> {
        let file = File::create(temp_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(
            &mut encoder,
            &CacheFileRef {
                version: CACHE_VERSION,
                session_id: &cache.session_id,
                entries: &cache.entries,
            },
        )?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::ResolvedMetadata;

    fn record(checksum: &str, size: u64) -> FingerprintRecord {
        FingerprintRecord {
            checksum: checksum.to_string(),
            size,
            modified_ns: 1_700_000_000_000_000_000,
            last_synced_at: 1_700_000_100,
            metadata: Some(ResolvedMetadata { mode: 33204, uid: 1000, gid: 1000 }),
        }
    }

    fn write_gz(path: &Path, json: &str) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(json.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(dir.path().join("nested/cache.json.gz"));

        let mut cache = FingerprintCache::new();
        cache.insert("a.txt", record("c1", 4));
        cache.insert("sub/b.txt", record("c2", 9));
        store.save(&cache).unwrap();

        let loaded = store.try_load().unwrap();
        assert_eq!(loaded, cache);
        assert_eq!(loaded.session_id(), cache.session_id());
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_missing_file_gives_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(dir.path().join("none.json.gz"));
        let a = store.load();
        let b = store.load();
        assert!(a.is_empty());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_corrupt_file_is_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json.gz");
        fs::write(&path, b"definitely not gzip").unwrap();

        let store = FingerprintStore::new(&path);
        assert!(store.try_load().is_err());
        assert!(store.load().is_empty());

        write_gz(&path, r#"{"entries": {}}"#);
        assert!(store.load().is_empty());

        write_gz(&path, r#"{"version": 99, "session_id": "s", "entries": {}}"#);
        assert!(matches!(store.try_load(), Err(CacheError::Format(_))));
    }

    #[test]
    fn test_bad_entry_only_drops_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json.gz");
        write_gz(
            &path,
            r#"{"version": 1, "session_id": "abc", "entries": {
                "good": {"checksum": "c", "size": 1, "modified_ns": 2, "last_synced_at": 3},
                "legacy": {"checksum": "c", "size": 1, "modified_time": 2, "last_synced_at": 3},
                "bad": {"checksum": "c"}
            }}"#,
        );

        let cache = FingerprintStore::new(&path).load();
        assert_eq!(cache.session_id(), "abc");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("good").unwrap().metadata, None);
        assert_eq!(cache.get("good").unwrap().modified_ns, 2);
        // 秒级的旧记录读出来没有修改时间，比较时总会重新计算校验和
        assert_eq!(cache.get("legacy").unwrap().modified_ns, 0);
        assert!(cache.get("bad").is_none());
    }

    #[test]
    fn test_torn_temp_file_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(dir.path().join("cache.json.gz"));

        let mut cache = FingerprintCache::new();
        cache.insert("a.txt", record("c1", 4));
        store.save(&cache).unwrap();

        // 模拟写入临时文件时崩溃
        fs::write(store.temp_path(), b"\x1f\x8b\x08half-written").unwrap();
        assert_eq!(store.load(), cache);

        // 下一次保存覆盖残留的临时文件
        cache.insert("a.txt", record("c2", 5));
        store.save(&cache).unwrap();
        assert_eq!(store.load().get("a.txt").unwrap().checksum, "c2");
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(dir.path().join("cache.json.gz"));

        let mut cache = FingerprintCache::new();
        cache.insert("a.txt", record("c1", 4));
        store.save(&cache).unwrap();

        // 临时文件路径被目录占用，写入失败
        fs::create_dir(store.temp_path()).unwrap();
        let mut next = cache.clone();
        next.insert("b.txt", record("c3", 1));
        assert!(store.save(&next).is_err());

        assert_eq!(store.load(), cache);
    }
}

use crate::core::cache::FingerprintCache;
use crate::core::file_state::calculate_file_hash;
use crate::core::metadata::ResolvedMetadata;
use crate::core::scanner::FileSystemEntry;
use crate::error::LocalAccessError;
use serde::Serialize;
use std::fmt;

/// 需要上传的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadReason {
    /// 强制上传
    Forced,
    /// 未启用缓存
    CacheDisabled,
    /// 缓存中没有记录
    NotCached,
    /// 元数据与上次上传时不同
    MetadataChanged,
    /// 内容校验和不同
    ContentChanged,
}

/// 跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 目录已上传过
    Cached,
    /// 大小和修改时间都未变，未计算校验和
    Unchanged,
    /// 修改时间变了但校验和一致
    ChecksumMatch,
}

/// 变更检测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Upload(UploadReason),
}

impl Decision {
    pub fn is_upload(&self) -> bool {
        matches!(self, Decision::Upload(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Skip(SkipReason::Cached) => write!(f, "skip (cached)"),
            Decision::Skip(SkipReason::Unchanged) => write!(f, "skip (size/mtime unchanged)"),
            Decision::Skip(SkipReason::ChecksumMatch) => write!(f, "skip (checksum match)"),
            Decision::Upload(UploadReason::Forced) => write!(f, "upload (forced)"),
            Decision::Upload(UploadReason::CacheDisabled) => write!(f, "upload (cache disabled)"),
            Decision::Upload(UploadReason::NotCached) => write!(f, "upload (not cached)"),
            Decision::Upload(UploadReason::MetadataChanged) => write!(f, "upload (metadata changed)"),
            Decision::Upload(UploadReason::ContentChanged) => write!(f, "upload (content changed)"),
        }
    }
}

/// 变更检测器
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    force: bool,
    cache_enabled: bool,
}

impl ChangeDetector {
    pub fn new(force: bool, cache_enabled: bool) -> Self {
        Self {
            force,
            cache_enabled,
        }
    }

    /// 判断条目是否需要上传
    ///
    /// 只有缓存记录存在且大小或修改时间变化时才读取文件计算校验和；
    /// 目录从不计算校验和。
    pub async fn decide(
        &self,
        entry: &FileSystemEntry,
        metadata: &ResolvedMetadata,
        cache: &FingerprintCache,
    ) -> Result<Decision, LocalAccessError> {
        if self.force {
            return Ok(Decision::Upload(UploadReason::Forced));
        }
        if !self.cache_enabled {
            return Ok(Decision::Upload(UploadReason::CacheDisabled));
        }

        let Some(record) = cache.get(&entry.relative_path) else {
            return Ok(Decision::Upload(UploadReason::NotCached));
        };

        if record.metadata.is_some_and(|m| m != *metadata) {
            return Ok(Decision::Upload(UploadReason::MetadataChanged));
        }

        if entry.is_dir() {
            return Ok(Decision::Skip(SkipReason::Cached));
        }

        if record.size == entry.size && record.modified_ns == entry.modified_ns {
            return Ok(Decision::Skip(SkipReason::Unchanged));
        }

        let checksum = calculate_file_hash(&entry.local_path)
            .await
            .map_err(|e| LocalAccessError::new(entry.relative_path.clone(), e))?;

        if checksum == record.checksum {
            Ok(Decision::Skip(SkipReason::ChecksumMatch))
        } else {
            Ok(Decision::Upload(UploadReason::ContentChanged))
        }
    }
}

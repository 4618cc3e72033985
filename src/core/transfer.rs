//! 远程同步执行：上传单个条目、前缀目录标记、上传后校验

use crate::config::RetryOptions;
use crate::core::content_type::content_type_for;
use crate::core::file_state::{md5_hex, EtagHasher, FingerprintRecord, EMPTY_MD5, PART_SIZE};
use crate::core::metadata::ResolvedMetadata;
use crate::core::scanner::FileSystemEntry;
use crate::error::{LocalAccessError, RemoteError, SyncError};
use crate::storage::{object_key, CompletedPart, Storage, DIRECTORY_CONTENT_TYPE};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

/// 一次确认成功的上传
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub key: String,
    pub bytes: u64,
    pub record: FingerprintRecord,
}

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Missing,
    Mismatch { remote: Option<String> },
}

/// 读取下一个分块，文件结束时返回空
async fn read_part(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(PART_SIZE);
    (&mut *file).take(PART_SIZE as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

pub struct RemoteSyncExecutor {
    storage: Arc<dyn Storage>,
    bucket_prefix: String,
    retry: RetryOptions,
}

impl RemoteSyncExecutor {
    pub fn new(storage: Arc<dyn Storage>, bucket_prefix: impl Into<String>, retry: RetryOptions) -> Self {
        Self {
            storage,
            bucket_prefix: bucket_prefix.into(),
            retry,
        }
    }

    pub fn key_for(&self, entry: &FileSystemEntry) -> String {
        object_key(&self.bucket_prefix, &entry.relative_path, entry.is_dir())
    }

    /// 上传一个条目；后端确认后才返回新的指纹记录
    ///
    /// 不超过一个分块的文件单次上传，更大的文件按 `PART_SIZE` 分块流式上传，
    /// 记录的校验和与对应上传方式产生的 ETag 一致。
    /// 文件内容读取失败返回 `SyncError::Local`，远程错误已按重试策略处理，
    /// 返回的 `SyncError::Remote` 总是致命错误。
    pub async fn execute(
        &self,
        entry: &FileSystemEntry,
        metadata: &ResolvedMetadata,
    ) -> Result<UploadOutcome, SyncError> {
        let key = self.key_for(entry);
        let user_metadata = metadata.to_user_metadata(Some(entry.modified_secs()));

        let (checksum, bytes) = if entry.is_dir() {
            self.with_retry(&key, || {
                self.storage
                    .put_object(&key, Vec::new(), &user_metadata, DIRECTORY_CONTENT_TYPE)
            })
            .await?;
            (EMPTY_MD5.to_string(), 0)
        } else {
            self.upload_file(entry, &key, &user_metadata).await?
        };

        info!("已上传 {} ({} bytes)", key, bytes);

        Ok(UploadOutcome {
            key,
            bytes,
            record: FingerprintRecord {
                checksum,
                size: bytes,
                modified_ns: entry.modified_ns,
                last_synced_at: chrono::Utc::now().timestamp(),
                metadata: Some(*metadata),
            },
        })
    }

    /// 返回实际发送内容的校验和与字节数
    async fn upload_file(
        &self,
        entry: &FileSystemEntry,
        key: &str,
        user_metadata: &HashMap<String, String>,
    ) -> Result<(String, u64), SyncError> {
        let local_err = |e: std::io::Error| LocalAccessError::new(entry.relative_path.clone(), e);

        let mut file = File::open(&entry.local_path).await.map_err(local_err)?;
        let first = read_part(&mut file).await.map_err(local_err)?;
        let content_type = content_type_for(&entry.local_path, &first);

        let second = if first.len() == PART_SIZE {
            read_part(&mut file).await.map_err(local_err)?
        } else {
            Vec::new()
        };

        if second.is_empty() {
            let checksum = md5_hex(&first);
            let bytes = first.len() as u64;
            self.with_retry(key, || {
                self.storage
                    .put_object(key, first.clone(), user_metadata, &content_type)
            })
            .await?;
            return Ok((checksum, bytes));
        }

        let upload_id = self
            .with_retry(key, || {
                self.storage
                    .create_multipart_upload(key, user_metadata, &content_type)
            })
            .await?;
        debug!("开始分块上传 {} ({})", key, upload_id);

        let result = self
            .upload_parts(entry, key, &upload_id, file, first, second)
            .await;
        if result.is_err() {
            if let Err(e) = self.storage.abort_multipart_upload(key, &upload_id).await {
                warn!("放弃分块上传失败 {} ({}): {}", key, upload_id, e);
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        entry: &FileSystemEntry,
        key: &str,
        upload_id: &str,
        mut file: File,
        first: Vec<u8>,
        second: Vec<u8>,
    ) -> Result<(String, u64), SyncError> {
        let mut hasher = EtagHasher::new();
        let mut parts = Vec::new();
        let mut bytes = 0u64;
        let mut chunk = first;
        let mut lookahead = Some(second);

        while !chunk.is_empty() {
            let part_number = parts.len() as i32 + 1;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;

            let etag = self
                .with_retry(key, || {
                    self.storage
                        .upload_part(key, upload_id, part_number, chunk.clone())
                })
                .await?;
            debug!("{} 分块 {} 完成", key, part_number);
            parts.push(CompletedPart { part_number, etag });

            chunk = match lookahead.take() {
                Some(next) => next,
                None => read_part(&mut file)
                    .await
                    .map_err(|e| LocalAccessError::new(entry.relative_path.clone(), e))?,
            };
        }

        self.with_retry(key, || {
            self.storage
                .complete_multipart_upload(key, upload_id, &parts)
        })
        .await?;

        Ok((hasher.finalize(), bytes))
    }

    /// 确保前缀的每一级目录标记对象存在且元数据正确
    pub async fn ensure_prefix_markers(
        &self,
        markers: &[String],
        metadata: &ResolvedMetadata,
    ) -> Result<usize, RemoteError> {
        let expected = metadata.to_user_metadata(None);
        let mut created = 0;

        for key in markers {
            let head = self.with_retry(key, || self.storage.head_object(key)).await?;
            let up_to_date = head.is_some_and(|h| {
                expected
                    .iter()
                    .all(|(k, v)| h.user_metadata.get(k) == Some(v))
            });
            if up_to_date {
                debug!("前缀标记已存在: {}", key);
                continue;
            }

            self.with_retry(key, || {
                self.storage
                    .put_object(key, Vec::new(), &expected, DIRECTORY_CONTENT_TYPE)
            })
            .await?;
            info!("已创建前缀标记 {}", key);
            created += 1;
        }

        Ok(created)
    }

    /// 比较远程 ETag 和大小与上传时的记录
    pub async fn verify(
        &self,
        key: &str,
        checksum: &str,
        size: u64,
    ) -> Result<VerifyOutcome, RemoteError> {
        let head = self.with_retry(key, || self.storage.head_object(key)).await?;

        let outcome = match head {
            None => VerifyOutcome::Missing,
            Some(h) if h.etag.as_deref() == Some(checksum) && h.size == size => {
                VerifyOutcome::Verified
            }
            Some(h) => VerifyOutcome::Mismatch { remote: h.etag },
        };

        match &outcome {
            VerifyOutcome::Verified => info!("sync verified: {}", key),
            VerifyOutcome::Missing => error!("bad upload: {} 远程对象不存在", key),
            VerifyOutcome::Mismatch { remote } => error!(
                "bad upload: {} 本地 {} 远程 {}",
                key,
                checksum,
                remote.as_deref().unwrap_or("-")
            ),
        }
        Ok(outcome)
    }

    /// 带重试的远程操作，指数退避；重试耗尽后升级为致命错误
    async fn with_retry<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_retries = self.retry.max_retries;
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt < max_retries => {
                    let delay = self.retry.base_delay * 2_u32.pow(attempt);
                    warn!(
                        "{} 操作失败，{:?} 后重试 ({}/{}): {}",
                        key,
                        delay,
                        attempt + 1,
                        max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} 操作最终失败 (已重试{}次): {}", key, max_retries, e);
                    return Err(e.escalate());
                }
            }
        }
    }
}

//! 同步引擎：一轮同步的编排与自动同步循环

use crate::config::SyncOptions;
use crate::core::cache::{FingerprintCache, FingerprintStore};
use crate::core::comparator::{ChangeDetector, Decision, SkipReason, UploadReason};
use crate::core::metadata::MetadataResolver;
use crate::core::scanner::TreeWalker;
use crate::core::transfer::{RemoteSyncExecutor, VerifyOutcome};
use crate::error::{Result, SyncError};
use crate::storage::Storage;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    /// 遇到致命远程错误
    Aborted,
    Cancelled,
}

/// 单个条目的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Uploaded {
        path: String,
        reason: UploadReason,
        bytes: u64,
    },
    Skipped {
        path: String,
        reason: SkipReason,
    },
    LocalError {
        path: String,
        message: String,
    },
    RemoteError {
        path: String,
        message: String,
    },
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub session_id: String,
    pub status: SyncStatus,
    pub started_at: i64,
    pub finished_at: i64,
    pub scanned: u32,
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub bytes_uploaded: u64,
    pub verify_failures: u32,
    pub cache_persisted: bool,
    pub outcomes: Vec<EntryOutcome>,
    pub fatal_error: Option<String>,
}

impl SyncReport {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: SyncStatus::Completed,
            started_at: chrono::Utc::now().timestamp(),
            finished_at: 0,
            scanned: 0,
            uploaded: 0,
            skipped: 0,
            failed: 0,
            bytes_uploaded: 0,
            verify_failures: 0,
            cache_persisted: false,
            outcomes: Vec::new(),
            fatal_error: None,
        }
    }

    fn record(&mut self, outcome: EntryOutcome) {
        self.scanned += 1;
        match &outcome {
            EntryOutcome::Uploaded { bytes, .. } => {
                self.uploaded += 1;
                self.bytes_uploaded += bytes;
            }
            EntryOutcome::Skipped { .. } => self.skipped += 1,
            EntryOutcome::LocalError { .. } | EntryOutcome::RemoteError { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    fn abort(&mut self, message: String) {
        self.status = SyncStatus::Aborted;
        self.fatal_error = Some(message);
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed && self.failed == 0 && self.verify_failures == 0
    }
}

/// 本轮上传成功、待校验的文件
struct PendingVerify {
    key: String,
    checksum: String,
    size: u64,
}

/// 同步引擎
pub struct SyncEngine {
    options: SyncOptions,
    walker: TreeWalker,
    resolver: MetadataResolver,
    detector: ChangeDetector,
    executor: RemoteSyncExecutor,
}

impl SyncEngine {
    /// 配置在这里校验一次，之后的每一轮都不再校验
    pub fn new(options: SyncOptions, storage: Arc<dyn Storage>) -> Result<Self> {
        options.validate()?;

        info!(
            "同步引擎就绪: {:?} -> {} ({})",
            options.local_root,
            options.remote,
            storage.name()
        );

        Ok(Self {
            walker: TreeWalker::new(&options.local_root),
            resolver: MetadataResolver::new(options.metadata.clone()),
            detector: ChangeDetector::new(options.force, options.cache.enabled),
            executor: RemoteSyncExecutor::new(
                storage,
                options.remote.bucket_prefix(),
                options.retry,
            ),
            options,
        })
    }

    /// 运行同步；配置了间隔时持续运行，直到取消
    ///
    /// 返回最后一轮的报告。致命错误只结束当前这一轮，下一轮照常开始。
    pub async fn run(&self, cancel: &CancellationToken) -> SyncReport {
        loop {
            let report = self.run_pass(cancel).await;

            let Some(interval) = self.options.interval else {
                return report;
            };
            if report.status == SyncStatus::Cancelled || cancel.is_cancelled() {
                return report;
            }

            info!("自动同步: {:?} 后开始下一轮", interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("自动同步已停止");
                    return report;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// 执行一轮同步
    pub async fn run_pass(&self, cancel: &CancellationToken) -> SyncReport {
        let store = self
            .options
            .cache
            .enabled
            .then(|| FingerprintStore::new(self.options.cache.path()));
        let mut cache = match &store {
            Some(store) => store.load(),
            None => FingerprintCache::new(),
        };

        let mut report = SyncReport::new(cache.session_id());
        info!(
            "开始同步 {:?} -> {} (session {})",
            self.walker.root(),
            self.options.remote,
            report.session_id
        );

        let marker_metadata = self.resolver.resolve_prefix_marker();
        let markers = self.options.remote.prefix_markers();
        let mut pending = Vec::new();

        match self
            .executor
            .ensure_prefix_markers(&markers, &marker_metadata)
            .await
        {
            Ok(_) => {
                pending = self.sync_entries(&mut cache, &mut report, cancel).await;
            }
            Err(e) => {
                error!("无法创建前缀标记，同步中止: {}", e);
                report.abort(e.to_string());
            }
        }

        // 中止或取消后同样保存，缓存只包含已确认的上传
        if let Some(store) = &store {
            match store.save(&cache) {
                Ok(()) => report.cache_persisted = true,
                Err(e) => error!("保存缓存失败 {:?}: {}", store.path(), e),
            }
        }

        if self.options.verify && report.status != SyncStatus::Aborted {
            self.verify_uploads(&pending, &mut report).await;
        }

        report.finished_at = chrono::Utc::now().timestamp();
        info!(
            "同步结束 ({:?}): 扫描 {}, 上传 {}, 跳过 {}, 失败 {}, {} bytes",
            report.status,
            report.scanned,
            report.uploaded,
            report.skipped,
            report.failed,
            report.bytes_uploaded
        );
        report
    }

    async fn sync_entries(
        &self,
        cache: &mut FingerprintCache,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Vec<PendingVerify> {
        let mut pending = Vec::new();

        for item in self.walker.iter() {
            if cancel.is_cancelled() {
                info!("同步已取消");
                report.status = SyncStatus::Cancelled;
                break;
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("跳过无法访问的条目 {}", e);
                    report.record(EntryOutcome::LocalError {
                        path: e.path.clone(),
                        message: e.source.to_string(),
                    });
                    continue;
                }
            };

            let metadata = self.resolver.resolve(&entry);
            let decision = match self.detector.decide(&entry, &metadata, cache).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("跳过无法读取的文件 {}", e);
                    report.record(EntryOutcome::LocalError {
                        path: e.path.clone(),
                        message: e.source.to_string(),
                    });
                    continue;
                }
            };
            debug!("{}: {}", entry.relative_path, decision);

            let reason = match decision {
                Decision::Skip(reason) => {
                    if reason == SkipReason::ChecksumMatch {
                        // 内容未变，只刷新修改时间，下次走快速路径
                        if let Some(mut record) = cache.get(&entry.relative_path).cloned() {
                            record.modified_ns = entry.modified_ns;
                            cache.insert(entry.relative_path.clone(), record);
                        }
                    }
                    report.record(EntryOutcome::Skipped {
                        path: entry.relative_path,
                        reason,
                    });
                    continue;
                }
                Decision::Upload(reason) => reason,
            };

            match self.executor.execute(&entry, &metadata).await {
                Ok(outcome) => {
                    if !entry.is_dir() {
                        pending.push(PendingVerify {
                            key: outcome.key,
                            checksum: outcome.record.checksum.clone(),
                            size: outcome.record.size,
                        });
                    }
                    cache.insert(entry.relative_path.clone(), outcome.record);
                    report.record(EntryOutcome::Uploaded {
                        path: entry.relative_path,
                        reason,
                        bytes: outcome.bytes,
                    });
                }
                Err(SyncError::Local(e)) => {
                    warn!("跳过无法读取的文件 {}", e);
                    report.record(EntryOutcome::LocalError {
                        path: e.path.clone(),
                        message: e.source.to_string(),
                    });
                }
                Err(e) => {
                    error!("上传 {} 失败，同步中止: {}", entry.relative_path, e);
                    report.record(EntryOutcome::RemoteError {
                        path: entry.relative_path,
                        message: e.to_string(),
                    });
                    report.abort(e.to_string());
                    break;
                }
            }
        }

        pending
    }

    /// 校验失败只记录，不影响缓存
    async fn verify_uploads(&self, pending: &[PendingVerify], report: &mut SyncReport) {
        for (index, item) in pending.iter().enumerate() {
            match self.executor.verify(&item.key, &item.checksum, item.size).await {
                Ok(VerifyOutcome::Verified) => {}
                Ok(_) => report.verify_failures += 1,
                Err(e) => {
                    let remaining = pending.len() - index;
                    error!("校验中断，{} 个文件未校验: {}", remaining, e);
                    report.verify_failures += remaining as u32;
                    return;
                }
            }
        }
    }
}

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{RemoteTarget, SyncOptions};
pub use core::{EntryOutcome, SyncEngine, SyncReport, SyncStatus};
pub use error::{Result, SyncError};

/// 用户目录（只在命令行入口使用，引擎不读取环境变量）
pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("USERPROFILE").ok().map(PathBuf::from)
        } else {
            std::env::var("HOME").ok().map(PathBuf::from)
        }
    }

    /// 默认缓存目录 `$HOME/.s3sync`
    pub fn cache_dir() -> PathBuf {
        home_dir()
            .map(|h| h.join(".s3sync"))
            .unwrap_or_else(|| PathBuf::from(".s3sync"))
    }
}

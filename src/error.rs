//! 错误类型

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 配置错误：在任何同步轮次开始前拒绝
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("local path does not exist: {0}")]
    MissingLocalRoot(PathBuf),

    #[error("invalid remote target '{0}', expected s3://bucket/prefix")]
    InvalidRemote(String),

    #[error("interval must be a positive number of minutes, got {0}")]
    InvalidInterval(f64),

    #[error("invalid metadata override: {0}")]
    InvalidMetadata(String),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// 本地条目无法访问（按条目恢复，不中断同步）
#[derive(Debug, Error)]
#[error("{path}: {source}")]
pub struct LocalAccessError {
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl LocalAccessError {
    pub fn new(path: impl Into<String>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// 指纹缓存文件读写错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),

    #[error("cache decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported cache format: {0}")]
    Format(String),
}

/// 远程存储错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// 可重试：限流、超时、网络、5xx
    #[error("transient remote error: {0}")]
    Transient(String),

    /// 不可重试：认证、授权、bucket 不存在，或重试耗尽
    #[error("fatal remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// 重试耗尽后升级为致命错误
    pub fn escalate(self) -> Self {
        match self {
            RemoteError::Transient(msg) => RemoteError::Fatal(format!("retries exhausted: {}", msg)),
            fatal => fatal,
        }
    }
}

/// 顶层错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Local(#[from] LocalAccessError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalate() {
        let err = RemoteError::Transient("SlowDown".to_string()).escalate();
        assert!(!err.is_transient());
        assert_eq!(err, RemoteError::Fatal("retries exhausted: SlowDown".to_string()));

        let fatal = RemoteError::Fatal("AccessDenied".to_string());
        assert_eq!(fatal.clone().escalate(), fatal);
    }
}

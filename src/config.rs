//! 同步配置
//!
//! 由命令行层一次性构造并校验，核心引擎不读取任何环境变量。

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 目录默认 mode（0o775）
pub const DEFAULT_DIR_MODE: u32 = 509;
/// 文件默认 mode（0o100664）
pub const DEFAULT_FILE_MODE: u32 = 33204;
/// 缓存文件名后缀
pub const CACHE_FILE_SUFFIX: &str = "s3sync_md5_cache.json.gz";

/// 远程目标：bucket + 前缀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub bucket: String,
    /// 规范化后的前缀，为空或以 `/` 结尾
    prefix: String,
}

impl RemoteTarget {
    pub fn new(bucket: impl Into<String>, prefix: &str) -> Result<Self, ConfigError> {
        let bucket = bucket.into();
        if bucket.is_empty() || bucket.contains('/') {
            return Err(ConfigError::InvalidRemote(format!("{}/{}", bucket, prefix)));
        }
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Ok(Self { bucket, prefix })
    }

    /// 解析 `s3://bucket/prefix`
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| ConfigError::InvalidRemote(uri.to_string()))?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigError::InvalidRemote(uri.to_string()));
        }
        Self::new(bucket, prefix)
    }

    /// bucket 内的键前缀（`""` 或 `"a/b/"`）
    pub fn bucket_prefix(&self) -> &str {
        &self.prefix
    }

    /// 前缀的所有祖先目录标记，由浅到深，例如 `home/`, `home/alice/`
    pub fn prefix_markers(&self) -> Vec<String> {
        let mut markers = Vec::new();
        let mut acc = String::new();
        for part in self.prefix.split('/').filter(|p| !p.is_empty()) {
            acc.push_str(part);
            acc.push('/');
            markers.push(acc.clone());
        }
        markers
    }
}

impl FromStr for RemoteTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

/// 全局元数据覆盖（`--metadata '{"uid":"6812","gid":"6812"}'`）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataOverride {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub uid: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_id")]
    pub gid: Option<u32>,
}

impl MetadataOverride {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidMetadata(e.to_string()))
    }
}

/// uid/gid 既可以是数字也可以是十进制字符串
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdValue {
        Num(u32),
        Text(String),
    }

    match Option::<IdValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IdValue::Num(n)) => Ok(Some(n)),
        Some(IdValue::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid id '{}'", s))),
    }
}

/// 解析 `--uid` / `--gid` 等数字参数
pub fn parse_id(field: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// 元数据解析配置
#[derive(Debug, Clone)]
pub struct MetadataOptions {
    pub override_map: Option<MetadataOverride>,
    pub uid_override: Option<u32>,
    pub gid_override: Option<u32>,
    pub default_dir_mode: u32,
    pub default_file_mode: u32,
    /// 检测不到 uid 时使用（命令行层填入进程的有效 uid）
    pub default_uid: u32,
    pub default_gid: u32,
    /// 忽略本地 mode，统一使用默认值
    pub use_default_modes: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            override_map: None,
            uid_override: None,
            gid_override: None,
            default_dir_mode: DEFAULT_DIR_MODE,
            default_file_mode: DEFAULT_FILE_MODE,
            default_uid: 0,
            default_gid: 0,
            use_default_modes: false,
        }
    }
}

/// 指纹缓存配置
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub enabled: bool,
    pub dir: PathBuf,
    pub file_name: String,
}

impl CacheOptions {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from(".s3sync"),
            file_name: default_cache_file_name(),
        }
    }
}

/// 生成新的缓存文件名：`<时间>_<uuid>_s3sync_md5_cache.json.gz`
///
/// 不指定文件名时每次运行都会得到新的缓存谱系，因此需要重新计算全部校验和。
pub fn default_cache_file_name() -> String {
    format!(
        "{}_{}_{}",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"),
        uuid::Uuid::new_v4(),
        CACHE_FILE_SUFFIX
    )
}

/// 重试配置
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(2000),
        }
    }
}

/// 一次同步（或自动同步）的完整配置
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub local_root: PathBuf,
    pub remote: RemoteTarget,
    pub metadata: MetadataOptions,
    pub cache: CacheOptions,
    /// 忽略缓存，全部重新上传
    pub force: bool,
    /// 同步后用 ETag 校验上传结果
    pub verify: bool,
    /// 自动同步间隔，`None` 表示只同步一次
    pub interval: Option<Duration>,
    pub retry: RetryOptions,
}

impl SyncOptions {
    pub fn new(local_root: impl Into<PathBuf>, remote: RemoteTarget) -> Self {
        Self {
            local_root: local_root.into(),
            remote,
            metadata: MetadataOptions::default(),
            cache: CacheOptions::default(),
            force: false,
            verify: true,
            interval: None,
            retry: RetryOptions::default(),
        }
    }

    /// 在任何同步开始前校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.local_root.exists() {
            return Err(ConfigError::MissingLocalRoot(self.local_root.clone()));
        }
        if let Some(interval) = self.interval {
            if interval.is_zero() {
                return Err(ConfigError::InvalidInterval(0.0));
            }
        }
        if self.cache.enabled && self.cache.file_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache file name",
                value: self.cache.file_name.clone(),
            });
        }
        Ok(())
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }
}

/// 分钟数转换为间隔；必须是大于 0 的有限数
pub fn interval_from_minutes(minutes: f64) -> Result<Duration, ConfigError> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(ConfigError::InvalidInterval(minutes));
    }
    Duration::try_from_secs_f64(minutes * 60.0).map_err(|_| ConfigError::InvalidInterval(minutes))
}

use clap::Parser;
use s3sync_lib::config::{
    default_cache_file_name, interval_from_minutes, parse_id, CacheOptions, MetadataOptions,
    MetadataOverride, RemoteTarget, SyncOptions, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
};
use s3sync_lib::error::ConfigError;
use s3sync_lib::logging::{LogConfig, SizeRotatingWriter};
use s3sync_lib::storage::S3Storage;
use s3sync_lib::{dirs, SyncEngine, SyncStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "s3sync")]
#[command(about = "Sync a local tree to S3, keeping POSIX mode/uid/gid as object metadata")]
#[command(version)]
struct Cli {
    /// Local file or directory to sync
    local: PathBuf,

    /// Remote target, s3://bucket/prefix
    remote: String,

    /// Upload everything, ignoring the local cache
    #[arg(long)]
    force: bool,

    /// Global uid/gid override as JSON, e.g. '{"uid": 1000, "gid": 1000}'
    #[arg(long)]
    metadata: Option<String>,

    /// Mode used for directories without a detected mode
    #[arg(long, default_value_t = DEFAULT_DIR_MODE)]
    meta_dir_mode: u32,

    /// Mode used for files without a detected mode
    #[arg(long, default_value_t = DEFAULT_FILE_MODE)]
    meta_file_mode: u32,

    /// Always use the default modes instead of the local ones
    #[arg(long)]
    use_default_modes: bool,

    /// AWS profile name
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// uid attached to every object
    #[arg(long, value_parser = |s: &str| parse_id("uid", s))]
    uid: Option<u32>,

    /// gid attached to every object
    #[arg(long, value_parser = |s: &str| parse_id("gid", s))]
    gid: Option<u32>,

    /// Keep a local checksum cache between passes
    #[arg(long)]
    localcache: bool,

    /// Cache directory (default: $HOME/.s3sync)
    #[arg(long)]
    localcache_dir: Option<PathBuf>,

    /// Cache file name; reuse the same name to keep the cache across runs
    #[arg(long)]
    localcache_fname: Option<String>,

    /// Autosync interval in minutes
    #[arg(long)]
    interval: Option<f64>,

    /// Skip the ETag check after uploading
    #[arg(long)]
    no_verify: bool,

    /// Retries for transient S3 errors
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,

    /// Also write logs to s3sync.log in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Maximum log file size in MB before rotation
    #[arg(long, default_value_t = 5)]
    log_max_size: u32,

    /// Custom S3 endpoint (MinIO, Ceph, ...)
    #[arg(long, env = "S3SYNC_ENDPOINT")]
    endpoint: Option<String>,

    /// AWS region
    #[arg(long)]
    region: Option<String>,
}

/// 初始化日志系统
fn init_logging(config: &LogConfig) {
    let file_layer = config.log_dir.as_ref().and_then(|dir| {
        match SizeRotatingWriter::new(dir, config.max_size_mb) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                // 文件日志创建失败，只输出到控制台
                eprintln!("无法创建日志文件 {:?}: {}", dir, e);
                None
            }
        }
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// 进程的有效 uid/gid，作为无法检测时的默认值
fn effective_ids() -> (u32, u32) {
    #[cfg(unix)]
    {
        // SAFETY: geteuid/getegid 总是成功，没有副作用
        unsafe { (libc::geteuid(), libc::getegid()) }
    }
    #[cfg(not(unix))]
    {
        (0, 0)
    }
}

fn build_options(cli: &Cli) -> Result<SyncOptions, ConfigError> {
    let remote = RemoteTarget::parse(&cli.remote)?;
    let (euid, egid) = effective_ids();

    let mut options = SyncOptions::new(&cli.local, remote);
    options.metadata = MetadataOptions {
        override_map: cli
            .metadata
            .as_deref()
            .map(MetadataOverride::from_json)
            .transpose()?,
        uid_override: cli.uid,
        gid_override: cli.gid,
        default_dir_mode: cli.meta_dir_mode,
        default_file_mode: cli.meta_file_mode,
        default_uid: euid,
        default_gid: egid,
        use_default_modes: cli.use_default_modes,
    };
    options.cache = CacheOptions {
        enabled: cli.localcache,
        dir: cli.localcache_dir.clone().unwrap_or_else(dirs::cache_dir),
        file_name: cli
            .localcache_fname
            .clone()
            .unwrap_or_else(default_cache_file_name),
    };
    options.force = cli.force;
    options.verify = !cli.no_verify;
    options.interval = cli.interval.map(interval_from_minutes).transpose()?;
    options.retry.max_retries = cli.max_retries;

    options.validate()?;
    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig {
        level: cli.log.clone(),
        log_dir: cli.log_dir.clone(),
        max_size_mb: cli.log_max_size,
    });

    let options = build_options(&cli)?;
    if options.cache.enabled {
        info!("本地缓存: {:?}", options.cache.path());
    }

    let storage = S3Storage::new(
        &options.remote.bucket,
        cli.profile.as_deref(),
        cli.region.clone(),
        cli.endpoint.clone(),
    )
    .await;
    let engine = SyncEngine::new(options, Arc::new(storage))?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，当前条目完成后停止");
            token.cancel();
        }
    });

    let report = engine.run(&cancel).await;
    debug!("同步报告: {}", serde_json::to_string(&report)?);

    if report.status == SyncStatus::Aborted {
        anyhow::bail!(
            "同步中止: {}",
            report.fatal_error.unwrap_or_default()
        );
    }
    if !report.is_success() {
        warn!(
            "同步完成，但有 {} 个条目失败，{} 个文件校验失败",
            report.failed, report.verify_failures
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("s3sync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_options() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let cli = parse(&[
            root,
            "s3://bucket/home/alice",
            "--localcache",
            "--localcache-dir",
            root,
            "--localcache-fname",
            "cache.json.gz",
            "--metadata",
            r#"{"uid": "1000"}"#,
            "--gid",
            "50",
            "--interval",
            "0.5",
            "--no-verify",
        ]);

        let options = build_options(&cli).unwrap();
        assert_eq!(options.remote.bucket, "bucket");
        assert_eq!(options.remote.bucket_prefix(), "home/alice/");
        assert_eq!(options.cache.path(), dir.path().join("cache.json.gz"));
        assert!(options.cache.enabled);
        assert_eq!(options.metadata.override_map.unwrap().uid, Some(1000));
        assert_eq!(options.metadata.gid_override, Some(50));
        assert_eq!(options.metadata.default_dir_mode, 509);
        assert_eq!(options.interval, Some(Duration::from_secs(30)));
        assert!(!options.verify);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();

        let cli = parse(&[root, "s3://bucket", "--interval", "0"]);
        assert!(matches!(build_options(&cli), Err(ConfigError::InvalidInterval(_))));

        let cli = parse(&[root, "http://bucket"]);
        assert!(matches!(build_options(&cli), Err(ConfigError::InvalidRemote(_))));

        let cli = parse(&[root, "s3://bucket", "--metadata", r#"{"mode": 1}"#]);
        assert!(matches!(build_options(&cli), Err(ConfigError::InvalidMetadata(_))));

        let cli = parse(&["/definitely/not/here", "s3://bucket"]);
        assert!(matches!(build_options(&cli), Err(ConfigError::MissingLocalRoot(_))));
    }
}

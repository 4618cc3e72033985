//! 元数据解析：覆盖参数 > 全局覆盖 > 本地检测值 > 默认值

use crate::config::MetadataOptions;
use crate::core::scanner::{EntryKind, FileSystemEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 附加到远程对象上的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl ResolvedMetadata {
    /// 转换为对象用户元数据（s3fs 读取 mode/uid/gid/mtime）
    pub fn to_user_metadata(&self, mtime: Option<i64>) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        meta.insert("mode".to_string(), self.mode.to_string());
        meta.insert("uid".to_string(), self.uid.to_string());
        meta.insert("gid".to_string(), self.gid.to_string());
        if let Some(mtime) = mtime {
            meta.insert("mtime".to_string(), mtime.to_string());
        }
        meta
    }
}

/// 元数据解析器（纯函数，无副作用）
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    options: MetadataOptions,
}

impl MetadataResolver {
    pub fn new(options: MetadataOptions) -> Self {
        Self { options }
    }

    pub fn resolve(&self, entry: &FileSystemEntry) -> ResolvedMetadata {
        let default_mode = self.default_mode(entry.kind);
        let mode = if self.options.use_default_modes {
            default_mode
        } else {
            entry.detected_mode.unwrap_or(default_mode)
        };

        ResolvedMetadata {
            mode,
            uid: self.resolve_uid(entry.detected_uid),
            gid: self.resolve_gid(entry.detected_gid),
        }
    }

    /// 前缀目录标记没有本地来源，只使用覆盖值和默认值
    pub fn resolve_prefix_marker(&self) -> ResolvedMetadata {
        ResolvedMetadata {
            mode: self.options.default_dir_mode,
            uid: self.resolve_uid(None),
            gid: self.resolve_gid(None),
        }
    }

    fn default_mode(&self, kind: EntryKind) -> u32 {
        match kind {
            EntryKind::File => self.options.default_file_mode,
            EntryKind::Directory => self.options.default_dir_mode,
        }
    }

    fn resolve_uid(&self, detected: Option<u32>) -> u32 {
        self.options
            .uid_override
            .or_else(|| self.options.override_map.and_then(|m| m.uid))
            .or(detected)
            .unwrap_or(self.options.default_uid)
    }

    fn resolve_gid(&self, detected: Option<u32>) -> u32 {
        self.options
            .gid_override
            .or_else(|| self.options.override_map.and_then(|m| m.gid))
            .or(detected)
            .unwrap_or(self.options.default_gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetadataOverride, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
    use std::path::PathBuf;

    fn entry(kind: EntryKind, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>) -> FileSystemEntry {
        FileSystemEntry {
            relative_path: "x".to_string(),
            local_path: PathBuf::from("/tmp/x"),
            kind,
            size: 0,
            modified_ns: 0,
            detected_mode: mode,
            detected_uid: uid,
            detected_gid: gid,
        }
    }

    fn options() -> MetadataOptions {
        MetadataOptions {
            default_uid: 500,
            default_gid: 501,
            ..Default::default()
        }
    }

    #[test]
    fn test_detected_values_win_over_defaults() {
        let resolver = MetadataResolver::new(options());
        let meta = resolver.resolve(&entry(EntryKind::File, Some(0o100644), Some(1000), Some(1001)));
        assert_eq!(meta, ResolvedMetadata { mode: 0o100644, uid: 1000, gid: 1001 });
    }

    #[test]
    fn test_uid_override_wins() {
        let resolver = MetadataResolver::new(MetadataOptions {
            uid_override: Some(2000),
            ..options()
        });
        let meta = resolver.resolve(&entry(EntryKind::File, Some(0o100644), Some(1000), Some(1001)));
        assert_eq!(meta.uid, 2000);
        assert_eq!(meta.gid, 1001);
    }

    #[test]
    fn test_override_map_applies_globally() {
        let resolver = MetadataResolver::new(MetadataOptions {
            override_map: Some(MetadataOverride { uid: Some(6812), gid: Some(6813) }),
            ..options()
        });
        let file = resolver.resolve(&entry(EntryKind::File, None, Some(1000), Some(1000)));
        let dir = resolver.resolve(&entry(EntryKind::Directory, None, Some(1), Some(1)));
        assert_eq!((file.uid, file.gid), (6812, 6813));
        assert_eq!((dir.uid, dir.gid), (6812, 6813));
    }

    #[test]
    fn test_flags_beat_override_map() {
        let resolver = MetadataResolver::new(MetadataOptions {
            override_map: Some(MetadataOverride { uid: Some(6812), gid: Some(6813) }),
            gid_override: Some(42),
            ..options()
        });
        let meta = resolver.resolve(&entry(EntryKind::File, None, Some(1000), Some(1000)));
        assert_eq!(meta.uid, 6812);
        assert_eq!(meta.gid, 42);
    }

    #[test]
    fn test_defaults_without_detection() {
        let resolver = MetadataResolver::new(options());
        let file = resolver.resolve(&entry(EntryKind::File, None, None, None));
        let dir = resolver.resolve(&entry(EntryKind::Directory, None, None, None));
        assert_eq!(file, ResolvedMetadata { mode: DEFAULT_FILE_MODE, uid: 500, gid: 501 });
        assert_eq!(dir.mode, DEFAULT_DIR_MODE);
    }

    #[test]
    fn test_use_default_modes() {
        let resolver = MetadataResolver::new(MetadataOptions {
            use_default_modes: true,
            ..options()
        });
        let meta = resolver.resolve(&entry(EntryKind::Directory, Some(0o40700), Some(1), Some(1)));
        assert_eq!(meta.mode, DEFAULT_DIR_MODE);
        assert_eq!(meta.uid, 1);
    }

    #[test]
    fn test_user_metadata() {
        let meta = ResolvedMetadata { mode: 33204, uid: 1000, gid: 1000 };
        let map = meta.to_user_metadata(Some(1700000000));
        assert_eq!(map["mode"], "33204");
        assert_eq!(map["uid"], "1000");
        assert_eq!(map["mtime"], "1700000000");
        assert!(!meta.to_user_metadata(None).contains_key("mtime"));
    }

    #[test]
    fn test_prefix_marker() {
        let resolver = MetadataResolver::new(MetadataOptions {
            uid_override: Some(7),
            ..options()
        });
        assert_eq!(
            resolver.resolve_prefix_marker(),
            ResolvedMetadata { mode: DEFAULT_DIR_MODE, uid: 7, gid: 501 }
        );
    }
}

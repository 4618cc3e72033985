//! 本地目录遍历

use crate::error::LocalAccessError;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// 本地文件系统条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemEntry {
    /// 相对根目录的路径，统一使用 `/`
    pub relative_path: String,
    /// 本地绝对路径
    pub local_path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    /// 修改时间（Unix 时间戳，纳秒）
    pub modified_ns: i64,
    pub detected_mode: Option<u32>,
    pub detected_uid: Option<u32>,
    pub detected_gid: Option<u32>,
}

impl FileSystemEntry {
    pub fn from_metadata(relative_path: String, local_path: PathBuf, metadata: &Metadata) -> Self {
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let modified_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        let (detected_mode, detected_uid, detected_gid) = detect_posix(metadata);

        Self {
            relative_path,
            local_path,
            kind,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified_ns,
            detected_mode,
            detected_uid,
            detected_gid,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// 修改时间（秒），写入对象元数据 `mtime`
    pub fn modified_secs(&self) -> i64 {
        self.modified_ns.div_euclid(NANOS_PER_SEC)
    }
}

#[cfg(unix)]
fn detect_posix(metadata: &Metadata) -> (Option<u32>, Option<u32>, Option<u32>) {
    use std::os::unix::fs::MetadataExt;
    (Some(metadata.mode()), Some(metadata.uid()), Some(metadata.gid()))
}

#[cfg(not(unix))]
fn detect_posix(_metadata: &Metadata) -> (Option<u32>, Option<u32>, Option<u32>) {
    (None, None, None)
}

/// 目录遍历器
///
/// 每次调用 [`TreeWalker::iter`] 都会重新开始一次遍历：目录总是先于其子项，
/// 同级按文件名排序，因此未变化的目录树每次得到相同的序列。
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iter(&self) -> Entries {
        // 根本身是文件时只同步这一个文件
        match std::fs::metadata(&self.root) {
            Ok(metadata) if metadata.is_file() => {
                let name = self
                    .root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string);
                let item = match name {
                    Some(name) => Ok(FileSystemEntry::from_metadata(
                        name,
                        self.root.clone(),
                        &metadata,
                    )),
                    None => Err(LocalAccessError::new(
                        self.root.display().to_string(),
                        io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
                    )),
                };
                Entries::Single(Some(item))
            }
            Ok(_) => Entries::Tree {
                root: self.root.clone(),
                walker: WalkDir::new(&self.root)
                    .follow_links(false)
                    .min_depth(1)
                    .sort_by_file_name()
                    .into_iter(),
            },
            Err(e) => Entries::Single(Some(Err(LocalAccessError::new(
                self.root.display().to_string(),
                e,
            )))),
        }
    }
}

/// 惰性条目序列
pub enum Entries {
    Single(Option<Result<FileSystemEntry, LocalAccessError>>),
    Tree {
        root: PathBuf,
        walker: walkdir::IntoIter,
    },
}

impl Iterator for Entries {
    type Item = Result<FileSystemEntry, LocalAccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Entries::Single(item) => item.take(),
            Entries::Tree { root, walker } => loop {
                let dent = match walker.next()? {
                    Ok(dent) => dent,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| relative_path(root, p).unwrap_or_else(|| p.display().to_string()))
                            .unwrap_or_default();
                        return Some(Err(LocalAccessError::new(path, io::Error::from(e))));
                    }
                };

                let Some(rel) = relative_path(root, dent.path()) else {
                    return Some(Err(LocalAccessError::new(
                        dent.path().display().to_string(),
                        io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8"),
                    )));
                };

                let metadata = if dent.path_is_symlink() {
                    // 指向文件的链接按目标内容同步，指向目录的链接不进入
                    match std::fs::metadata(dent.path()) {
                        Ok(m) if m.is_file() => m,
                        Ok(_) => {
                            debug!("跳过目录符号链接: {}", rel);
                            continue;
                        }
                        Err(e) => return Some(Err(LocalAccessError::new(rel, e))),
                    }
                } else {
                    match dent.metadata() {
                        Ok(m) => m,
                        Err(e) => return Some(Err(LocalAccessError::new(rel, io::Error::from(e)))),
                    }
                };

                if !metadata.is_file() && !metadata.is_dir() {
                    debug!("跳过特殊文件: {}", rel);
                    continue;
                }

                return Some(Ok(FileSystemEntry::from_metadata(
                    rel,
                    dent.path().to_path_buf(),
                    &metadata,
                )));
            },
        }
    }
}

/// 计算相对路径，统一使用 `/` 分隔
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn paths(walker: &TreeWalker) -> Vec<String> {
        walker
            .iter()
            .map(|e| e.unwrap().relative_path)
            .collect()
    }

    #[test]
    fn test_walk_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("b/inner/z.txt"), b"z").unwrap();
        fs::write(dir.path().join("b/c.txt"), b"c").unwrap();
        fs::write(dir.path().join("root.txt"), b"root").unwrap();

        let walker = TreeWalker::new(dir.path());
        let first = paths(&walker);
        assert_eq!(
            first,
            vec!["a", "b", "b/c.txt", "b/inner", "b/inner/z.txt", "root.txt"]
        );

        // 可重复遍历
        assert_eq!(paths(&walker), first);
    }

    #[test]
    fn test_entry_attributes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"data").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let entries: Vec<_> = TreeWalker::new(dir.path())
            .iter()
            .map(|e| e.unwrap())
            .collect();

        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 4);
        assert!(entries[0].modified_ns > 0);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].size, 0);

        #[cfg(unix)]
        {
            assert!(entries[0].detected_mode.is_some());
            assert!(entries[0].detected_uid.is_some());
        }
    }

    #[test]
    fn test_single_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.csv");
        fs::write(&file, b"1,2,3").unwrap();

        let walker = TreeWalker::new(&file);
        assert_eq!(walker.root(), file.as_path());
        let entries: Vec<_> = walker.iter().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "report.csv");
        assert_eq!(entries[0].size, 5);
    }

    #[test]
    fn test_modified_time_keeps_sub_second_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"data").unwrap();
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::new(1_700_000_000, 250_000_000);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let entry = TreeWalker::new(&path).iter().next().unwrap().unwrap();
        assert_eq!(entry.modified_ns, 1_700_000_000_250_000_000);
        assert_eq!(entry.modified_secs(), 1_700_000_000);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut iter = TreeWalker::new(dir.path().join("nope")).iter();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("b.link")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("c.link")).unwrap();
        fs::write(dir.path().join("d.txt"), b"d").unwrap();

        let results: Vec<_> = TreeWalker::new(dir.path()).iter().collect();
        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.path, "b.link");
        let link = results[2].as_ref().unwrap();
        assert_eq!(link.relative_path, "c.link");
        assert_eq!(link.kind, EntryKind::File);
        assert_eq!(link.size, 1);
        assert_eq!(results[3].as_ref().unwrap().relative_path, "d.txt");
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlink_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/x"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();

        assert_eq!(paths(&TreeWalker::new(dir.path())), vec!["real", "real/x"]);
    }
}

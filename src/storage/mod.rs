pub mod memory;
pub mod s3;

use crate::error::RemoteError;
use async_trait::async_trait;
use std::collections::HashMap;

pub use memory::MemoryStorage;
pub use s3::S3Storage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- head 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 上传等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远程对象信息（head 结果）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    /// 去掉引号的 ETag
    pub etag: Option<String>,
    pub user_metadata: HashMap<String, String>,
}

/// 目录对象和前缀标记的 Content-Type
pub const DIRECTORY_CONTENT_TYPE: &str = "inode/directory";

/// 分块上传中已完成的分块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 从 1 开始
    pub part_number: i32,
    pub etag: String,
}

/// 对象存储抽象接口
///
/// 单次上传的对象 ETag 是内容的 MD5；分块上传的对象 ETag 是
/// 各分块 MD5 拼接后的 MD5 加 `-<分块数>`。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 创建或覆盖对象，附带用户元数据
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<(), RemoteError>;

    /// 开始分块上传，返回 upload id
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<String, RemoteError>;

    /// 上传一个分块，返回该分块的 ETag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, RemoteError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), RemoteError>;

    /// 放弃分块上传，释放已上传的分块
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), RemoteError>;

    /// 获取对象信息，不存在时返回 `None`
    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, RemoteError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 远程对象键：`前缀 + 相对路径`，目录以 `/` 结尾
pub fn object_key(bucket_prefix: &str, relative_path: &str, is_dir: bool) -> String {
    let relative_path = relative_path.trim_start_matches('/');
    if is_dir {
        format!("{}{}/", bucket_prefix, relative_path.trim_end_matches('/'))
    } else {
        format!("{}{}", bucket_prefix, relative_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("docs/", "a.txt", false), "docs/a.txt");
        assert_eq!(object_key("docs/", "sub", true), "docs/sub/");
        assert_eq!(object_key("", "sub/inner", true), "sub/inner/");
        assert_eq!(object_key("", "a.txt", false), "a.txt");
    }
}

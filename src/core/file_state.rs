//! 文件指纹记录与校验和计算

use crate::core::metadata::ResolvedMetadata;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// 分块大小，与 S3 分块上传 ETag 的计算方式保持一致
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// 空内容的 MD5（目录、空文件）
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// 指纹记录：只有确认上传成功的条目才会有
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub checksum: String,
    pub size: u64,
    /// 修改时间（纳秒）；旧缓存中是秒级字段，读出来为 0，下次会重新计算校验和
    #[serde(default)]
    pub modified_ns: i64,
    pub last_synced_at: i64,
    /// 上传时附加的元数据，旧缓存中可能没有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResolvedMetadata>,
}

/// 与 S3 ETag 兼容的增量 MD5
///
/// 不超过一个分块时结果就是内容的 MD5；否则是各分块摘要拼接后的 MD5，
/// 加上 `-<分块数>` 后缀。
#[derive(Default)]
pub struct EtagHasher {
    part: Md5,
    part_len: usize,
    digests: Vec<u8>,
    parts: usize,
}

impl EtagHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (PART_SIZE - self.part_len).min(data.len());
            self.part.update(&data[..take]);
            self.part_len += take;
            data = &data[take..];

            if self.part_len == PART_SIZE {
                self.finish_part();
            }
        }
    }

    fn finish_part(&mut self) {
        let digest = std::mem::take(&mut self.part).finalize();
        self.digests.extend_from_slice(&digest);
        self.part_len = 0;
        self.parts += 1;
    }

    pub fn finalize(mut self) -> String {
        if self.parts == 0 {
            return hex::encode(self.part.finalize());
        }
        if self.part_len > 0 {
            self.finish_part();
        }
        if self.parts == 1 {
            return hex::encode(&self.digests);
        }
        format!("{}-{}", hex::encode(Md5::digest(&self.digests)), self.parts)
    }
}

/// 单次上传对象的 ETag：内容的 MD5
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 计算内存数据的校验和
pub fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = EtagHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// 流式计算文件校验和，不把整个文件读入内存
pub async fn calculate_file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = EtagHasher::new();
    let mut buf = vec![0u8; 1024 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

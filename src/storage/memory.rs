//! 内存对象存储，可注入失败，用于测试和演练
//!
//! ETag 与 S3 一致：单次上传为内容 MD5，分块上传为分块摘要的 MD5 加分块数。

use super::{CompletedPart, ObjectHead, Storage};
use crate::core::file_state::md5_hex;
use crate::error::RemoteError;
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 已存储的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub content_type: String,
    pub etag: String,
}

/// 进行中的分块上传
struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    content_type: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    /// 依次作用于后续的 put 和 upload_part 请求
    put_failures: VecDeque<RemoteError>,
    /// 指定 key 的上传请求始终失败
    key_failures: HashMap<String, RemoteError>,
    put_count: usize,
}

impl Inner {
    fn check_key(&self, key: &str) -> Result<(), RemoteError> {
        match self.key_failures.get(key) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn next_failure(&mut self) -> Result<(), RemoteError> {
        match self.put_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 让接下来的 put/upload_part 请求按顺序失败
    pub fn fail_next_puts(&self, errors: impl IntoIterator<Item = RemoteError>) {
        let mut inner = self.lock();
        inner.put_failures.extend(errors);
    }

    /// 让某个 key 的每次上传都失败
    pub fn fail_puts_for(&self, key: &str, error: RemoteError) {
        let mut inner = self.lock();
        inner.key_failures.insert(key.to_string(), error);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// 成功写入的对象次数（单次上传和完成的分块上传）
    pub fn put_count(&self) -> usize {
        self.lock().put_count
    }

    /// 未完成也未放弃的分块上传数
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// 直接改写对象内容（模拟远程被篡改或上传损坏）
    pub fn corrupt(&self, key: &str, body: Vec<u8>) {
        let mut inner = self.lock();
        if let Some(object) = inner.objects.get_mut(key) {
            object.etag = md5_hex(&body);
            object.body = body;
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check_key(key)?;
        inner.next_failure()?;

        let etag = md5_hex(&body);
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                metadata: metadata.clone(),
                content_type: content_type.to_string(),
                etag,
            },
        );
        inner.put_count += 1;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        let mut inner = self.lock();
        inner.check_key(key)?;

        inner.next_upload += 1;
        let upload_id = format!("upload-{}", inner.next_upload);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, RemoteError> {
        let mut inner = self.lock();
        inner.next_failure()?;

        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| RemoteError::Fatal(format!("NoSuchUpload: {}", upload_id)))?;
        let etag = md5_hex(&body);
        upload.parts.insert(part_number, body);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        let upload = match inner.uploads.get(upload_id) {
            Some(u) if u.key == key => u,
            _ => return Err(RemoteError::Fatal(format!("NoSuchUpload: {}", upload_id))),
        };

        let mut body = Vec::new();
        let mut digests = Vec::new();
        for part in parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .filter(|data| md5_hex(data) == part.etag)
                .ok_or_else(|| RemoteError::Fatal(format!("InvalidPart: {}", part.part_number)))?;
            digests.extend_from_slice(&Md5::digest(data));
            body.extend_from_slice(data);
        }

        let etag = format!("{}-{}", hex::encode(Md5::digest(&digests)), parts.len());
        let object = StoredObject {
            body,
            metadata: upload.metadata.clone(),
            content_type: upload.content_type.clone(),
            etag,
        };
        inner.uploads.remove(upload_id);
        inner.objects.insert(key.to_string(), object);
        inner.put_count += 1;
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), RemoteError> {
        self.lock().uploads.remove(upload_id);
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, RemoteError> {
        let inner = self.lock();
        Ok(inner.objects.get(key).map(|object| ObjectHead {
            size: object.body.len() as u64,
            etag: Some(object.etag.clone()),
            user_metadata: object.metadata.clone(),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_state::{calculate_hash, PART_SIZE};

    #[tokio::test]
    async fn test_put_and_head() {
        let storage = MemoryStorage::new();
        let mut meta = HashMap::new();
        meta.insert("mode".to_string(), "33204".to_string());

        storage
            .put_object("a.txt", b"abc".to_vec(), &meta, "text/plain")
            .await
            .unwrap();
        let head = storage.head_object("a.txt").await.unwrap().unwrap();
        assert_eq!(head.size, 3);
        assert_eq!(head.etag.as_deref(), Some("900150983cd24fb0d6963f7d28e17f72"));
        assert_eq!(head.user_metadata, meta);
        assert_eq!(storage.object("a.txt").unwrap().content_type, "text/plain");
        assert!(storage.head_object("b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_put_etag_is_plain_md5_even_when_large() {
        let storage = MemoryStorage::new();
        let data = vec![3u8; PART_SIZE + 1];

        storage
            .put_object("big", data.clone(), &HashMap::new(), "application/octet-stream")
            .await
            .unwrap();
        let head = storage.head_object("big").await.unwrap().unwrap();
        assert_eq!(head.etag, Some(md5_hex(&data)));
        assert_ne!(head.etag, Some(calculate_hash(&data)));
    }

    #[tokio::test]
    async fn test_multipart_etag() {
        let storage = MemoryStorage::new();
        let data: Vec<u8> = (0..PART_SIZE + 100).map(|i| (i % 7) as u8).collect();
        let meta = HashMap::from([("uid".to_string(), "1000".to_string())]);

        let id = storage
            .create_multipart_upload("big", &meta, "application/octet-stream")
            .await
            .unwrap();
        let mut parts = Vec::new();
        for (i, chunk) in data.chunks(PART_SIZE).enumerate() {
            let number = i as i32 + 1;
            let etag = storage.upload_part("big", &id, number, chunk.to_vec()).await.unwrap();
            parts.push(CompletedPart { part_number: number, etag });
        }
        assert_eq!(storage.pending_uploads(), 1);
        assert!(storage.object("big").is_none());

        storage.complete_multipart_upload("big", &id, &parts).await.unwrap();
        let head = storage.head_object("big").await.unwrap().unwrap();
        assert_eq!(head.etag, Some(calculate_hash(&data)));
        assert!(head.etag.unwrap().ends_with("-2"));
        assert_eq!(head.user_metadata, meta);
        assert_eq!(storage.object("big").unwrap().body, data);
        assert_eq!(storage.pending_uploads(), 0);
        assert_eq!(storage.put_count(), 1);
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_no_object() {
        let storage = MemoryStorage::new();
        let id = storage
            .create_multipart_upload("big", &HashMap::new(), "application/octet-stream")
            .await
            .unwrap();
        storage.upload_part("big", &id, 1, vec![1; 10]).await.unwrap();
        storage.abort_multipart_upload("big", &id).await.unwrap();

        assert_eq!(storage.pending_uploads(), 0);
        assert!(storage.object("big").is_none());
        assert!(storage.upload_part("big", &id, 2, vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let storage = MemoryStorage::new();
        storage.fail_next_puts([RemoteError::Transient("SlowDown".to_string())]);

        let meta = HashMap::new();
        let ct = "application/octet-stream";
        assert!(storage.put_object("k", vec![], &meta, ct).await.is_err());
        assert!(storage.put_object("k", vec![], &meta, ct).await.is_ok());
        assert_eq!(storage.put_count(), 1);

        storage.fail_puts_for("bad", RemoteError::Fatal("AccessDenied".to_string()));
        assert!(storage.put_object("bad", vec![], &meta, ct).await.is_err());
        assert!(storage.put_object("bad", vec![], &meta, ct).await.is_err());
        assert!(storage.create_multipart_upload("bad", &meta, ct).await.is_err());
        assert!(storage.put_object("good", vec![], &meta, ct).await.is_ok());
    }
}

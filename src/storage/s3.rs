use super::{CompletedPart, ObjectHead, Storage, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::error::RemoteError;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use std::collections::HashMap;
use std::time::Duration;

/// 不可重试的错误码：认证、授权、bucket 不存在
const FATAL_CODES: &[&str] = &[
    "AccessDenied",
    "AccountProblem",
    "AllAccessDisabled",
    "AuthorizationHeaderMalformed",
    "ExpiredToken",
    "InvalidAccessKeyId",
    "InvalidBucketName",
    "InvalidToken",
    "NoSuchBucket",
    "PermanentRedirect",
    "SignatureDoesNotMatch",
];

/// 可重试的错误码：限流、超时、服务端临时故障
const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
    "ThrottlingException",
];

pub struct S3Storage {
    client: Client,
    bucket: String,
    name: String,
}

impl S3Storage {
    /// 凭证由 AWS 默认链解析（可指定 profile）；重试由同步引擎负责，这里关闭 SDK 重试
    pub async fn new(
        bucket: &str,
        profile: Option<&str>,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .operation_timeout(Duration::from_secs(IO_TIMEOUT_SECS))
                    .build(),
            );

        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(ep) = endpoint {
            // 兼容 MinIO 等 S3 服务
            builder = builder.endpoint_url(ep).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            name: format!("s3://{}", bucket),
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(classify)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Fatal(format!("{}: 响应中没有 upload id", key)))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, RemoteError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;

        output.e_tag().map(str::to_string).ok_or_else(|| {
            RemoteError::Transient(format!("{}: 分块 {} 的响应中没有 ETag", key, part_number))
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), RemoteError> {
        let parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), RemoteError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, RemoteError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectHead {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
                user_metadata: output.metadata().cloned().unwrap_or_default(),
            })),
            Err(SdkError::ServiceError(se)) if se.err().is_not_found() => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 将 SDK 错误分为可重试与致命两类
fn classify<E>(err: SdkError<E, HttpResponse>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ConstructionFailure(_) => false,
        SdkError::ServiceError(se) => {
            is_transient_service_error(se.err().code(), se.raw().status().as_u16())
        }
        _ => true,
    };

    if transient {
        RemoteError::Transient(message)
    } else {
        RemoteError::Fatal(message)
    }
}

/// 先看错误码，没有可识别的错误码时按 HTTP 状态判断
fn is_transient_service_error(code: Option<&str>, status: u16) -> bool {
    if let Some(code) = code {
        if FATAL_CODES.contains(&code) {
            return false;
        }
        if TRANSIENT_CODES.contains(&code) {
            return true;
        }
    }
    matches!(status, 408 | 429 | 500..=599)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_classification() {
        assert!(!is_transient_service_error(Some("AccessDenied"), 403));
        assert!(!is_transient_service_error(Some("NoSuchBucket"), 404));
        assert!(!is_transient_service_error(Some("InvalidAccessKeyId"), 403));
        assert!(is_transient_service_error(Some("SlowDown"), 503));
        assert!(is_transient_service_error(Some("RequestTimeout"), 400));
        assert!(is_transient_service_error(None, 500));
        assert!(is_transient_service_error(None, 429));
        assert!(!is_transient_service_error(None, 403));
        assert!(!is_transient_service_error(Some("SomethingNew"), 400));
    }
}

// pgbackup/src/storage/s3.rs
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::{Bytes, BytesMut};
use s3::config::{
    BehaviorVersion, Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use s3::error::{DisplayErrorContext, SdkError};
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{DownloadLink, StorageTransport, normalize_key};
use crate::errors::{ConnectivityKind, EngineError, Result};
use crate::pg::ByteReader;
use crate::store::{DestinationTarget, ObjectProvider, SigningMode};
use crate::utils::secret::Secret;

/// Region sent to endpoints that ignore it but still require one.
pub const PLACEHOLDER_REGION: &str = "us-east-1";

/// rclone's marker for endpoints that only speak the legacy signature.
pub const LEGACY_SIGNATURE_REGION: &str = "other-v2-signature";

/// Multipart part size. Payloads below this go up in a single request.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Client settings derived from a destination, with provider quirks applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub signing: SigningMode,
    access_key: Secret,
    secret_key: Secret,
}

impl ClientSettings {
    pub fn from_destination(destination: &DestinationTarget) -> Result<Self> {
        let bucket = destination.bucket.trim();
        if bucket.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "destination {} has no bucket",
                destination.name
            )));
        }

        let endpoint = match destination.endpoint.trim() {
            "" if destination.provider == ObjectProvider::Aws => None,
            "" => {
                return Err(EngineError::InvalidConfig(format!(
                    "destination {} needs an endpoint",
                    destination.name
                )));
            }
            endpoint if endpoint.contains("://") => Some(endpoint.to_string()),
            endpoint => Some(format!("https://{endpoint}")),
        };

        let region = destination.region.trim();
        let legacy = region.eq_ignore_ascii_case(LEGACY_SIGNATURE_REGION);
        let region = if legacy || (region.is_empty() && destination.provider != ObjectProvider::Aws) {
            PLACEHOLDER_REGION.to_string()
        } else if region.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "destination {} needs a region",
                destination.name
            )));
        } else {
            region.to_string()
        };

        // The SDK cannot produce SigV2, so legacy endpoints get the most
        // permissive SigV4 variant.
        let signing = match (legacy, destination.signing, destination.provider) {
            (true, _, _) => SigningMode::V4UnsignedPayload,
            (false, Some(mode), _) => mode,
            (false, None, ObjectProvider::Aws) => SigningMode::V4,
            (false, None, ObjectProvider::Minio) => SigningMode::V4UnsignedPayload,
        };

        Ok(ClientSettings {
            bucket: bucket.to_string(),
            region,
            endpoint,
            force_path_style: destination.force_path_style,
            signing,
            access_key: destination.access_key.clone(),
            secret_key: destination.secret_key.clone(),
        })
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("s3:{}/{}", endpoint, self.bucket),
            None => format!("s3://{}", self.bucket),
        }
    }
}

/// Maps an HTTP status from the object store to a connectivity failure kind.
pub fn kind_for_status(status: u16) -> ConnectivityKind {
    match status {
        404 => ConnectivityKind::BucketMissing,
        401 | 403 => ConnectivityKind::CredentialsRejected,
        _ => ConnectivityKind::Other,
    }
}

fn classify<E, R>(err: &SdkError<E, R>, status: impl Fn(&R) -> u16) -> ConnectivityKind {
    match err {
        SdkError::ServiceError(service) => kind_for_status(status(service.raw())),
        SdkError::ResponseError(response) => kind_for_status(status(response.raw())),
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ConnectivityKind::Unreachable,
        _ => ConnectivityKind::Other,
    }
}

/// Archives stored in an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Transport {
    client: s3::Client,
    settings: ClientSettings,
}

impl S3Transport {
    pub async fn connect(destination: &DestinationTarget) -> Result<Self> {
        let settings = ClientSettings::from_destination(destination)?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(Credentials::new(
                settings.access_key.expose(),
                settings.secret_key.expose(),
                None,
                None,
                "pgbackup-destination",
            ));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = s3::config::Builder::from(&sdk_config).force_path_style(settings.force_path_style);
        if settings.signing == SigningMode::V4UnsignedPayload {
            builder = builder
                .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
                .response_checksum_validation(ResponseChecksumValidation::WhenRequired);
        }

        debug!(
            destination = %destination.name,
            endpoint = %settings.describe(),
            region = %settings.region,
            path_style = settings.force_path_style,
            signing = ?settings.signing,
            "built object storage client"
        );
        Ok(Self {
            client: s3::Client::from_conf(builder.build()),
            settings,
        })
    }

    fn unsigned(&self) -> bool {
        self.settings.signing == SigningMode::V4UnsignedPayload
    }

    fn storage_error<E, R>(&self, action: &str, key: &str, err: SdkError<E, R>) -> EngineError
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        EngineError::Storage(format!(
            "{action} {key} in {} failed: {}",
            self.settings.describe(),
            DisplayErrorContext(&err)
        ))
    }

    async fn put_single(&self, key: &str, payload: Bytes) -> Result<u64> {
        let size = payload.len() as u64;
        let request = self
            .client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .content_length(size as i64)
            .body(ByteStream::from(payload));
        let sent = if self.unsigned() {
            request.customize().disable_payload_signing().send().await
        } else {
            request.send().await
        };
        sent.map_err(|e| self.storage_error("uploading", key, e))?;
        Ok(size)
    }

    async fn put_multipart(&self, key: &str, first: Bytes, body: &mut ByteReader) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| self.storage_error("starting multipart upload of", key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| EngineError::Storage("multipart upload returned no id".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, body).await {
            Ok((parts, size)) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.settings.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| self.storage_error("completing multipart upload of", key, e))?;
                Ok(size)
            }
            Err(err) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.settings.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort), "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        body: &mut ByteReader,
    ) -> Result<(Vec<CompletedPart>, u64)> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut part = first;
        let mut number = 1i32;

        while !part.is_empty() {
            total += part.len() as u64;
            let request = self
                .client
                .upload_part()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .content_length(part.len() as i64)
                .body(ByteStream::from(part));
            let sent = if self.unsigned() {
                request.customize().disable_payload_signing().send().await
            } else {
                request.send().await
            };
            let uploaded = sent.map_err(|e| self.storage_error("uploading part of", key, e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(number)
                    .build(),
            );
            debug!(key, part = number, total, "uploaded part");

            number += 1;
            part = read_part(body, PART_SIZE).await?;
        }
        Ok((parts, total))
    }
}

/// Object content type, from the key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "zip" => "application/zip",
        Some(ext) if ext == "sql" => "application/sql",
        _ => "application/octet-stream",
    }
}

/// Reads until `limit` bytes are buffered or the stream ends.
async fn read_part(body: &mut ByteReader, limit: usize) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(limit);
    while buf.len() < limit {
        let read = body
            .as_mut()
            .take((limit - buf.len()) as u64)
            .read_buf(&mut buf)
            .await?;
        if read == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

#[async_trait]
impl StorageTransport for S3Transport {
    fn describe(&self) -> String {
        self.settings.describe()
    }

    async fn test(&self) -> Result<()> {
        match self
            .client
            .head_bucket()
            .bucket(&self.settings.bucket)
            .send()
            .await
        {
            Ok(_) => {
                info!(target = %self.describe(), "object storage connection test passed");
                Ok(())
            }
            Err(err) => Err(EngineError::Connectivity {
                target: self.describe(),
                kind: classify(&err, |raw| raw.status().as_u16()),
                message: DisplayErrorContext(&err).to_string(),
            }),
        }
    }

    async fn upload(&self, key: &str, mut body: ByteReader) -> Result<u64> {
        let key = normalize_key(key);
        let first = read_part(&mut body, PART_SIZE).await?;
        let size = if first.len() < PART_SIZE {
            self.put_single(key, first).await?
        } else {
            self.put_multipart(key, first, &mut body).await?
        };
        info!(target = %self.describe(), key, bytes = size, "uploaded archive");
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key);
        self.client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.storage_error("deleting", key, e))?;
        debug!(target = %self.describe(), key, "deleted archive");
        Ok(())
    }

    async fn download_link(&self, key: &str, ttl: Duration) -> Result<DownloadLink> {
        let key = normalize_key(key);
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| EngineError::InvalidConfig(format!("invalid link lifetime: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| self.storage_error("presigning", key, e))?;
        Ok(DownloadLink::Url(request.uri().to_string()))
    }
}

//! S3-compatible storage client
//!
//! Wraps the AWS SDK multipart-upload calls used by the S3 backend.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};

use crate::config::S3Config;

use super::{RemotePart, StorageError};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> Result<Self, StorageError> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "vessel",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials);

        if let Some(endpoint) = &config.endpoint {
            // Path-style addressing for MinIO and other S3-compatible services
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    e
                );
            }
        }

        Ok(Self { client, bucket })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Start a multipart upload, returning its upload id
    pub async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StorageError::Remote(format!("Failed to create multipart upload {}: {}", key, e))
            })?;

        response
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Remote(format!("No upload id returned for {}", key)))
    }

    /// Upload one part, returning its ETag
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: &[u8],
    ) -> Result<Option<String>, StorageError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| {
                StorageError::Remote(format!(
                    "Failed to upload part {} of {}: {}",
                    part_number, key, e
                ))
            })?;

        Ok(response.e_tag().map(|s| s.to_string()))
    }

    /// List every part S3 holds for a multipart upload (handles pagination)
    pub async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<RemotePart>, StorageError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id);

            if let Some(m) = marker.take() {
                request = request.part_number_marker(m);
            }

            let response = request.send().await.map_err(|e| {
                StorageError::Remote(format!("Failed to list parts of {}: {}", key, e))
            })?;

            parts.extend(response.parts().iter().filter_map(|p| {
                Some(RemotePart {
                    part_id: u32::try_from(p.part_number()?).ok()?,
                    size: u64::try_from(p.size().unwrap_or(0)).unwrap_or(0),
                    etag: p.e_tag().map(|s| s.to_string()),
                })
            }));

            if !response.is_truncated().unwrap_or(false) {
                break;
            }

            match response.next_part_number_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        Ok(parts)
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), StorageError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|(number, etag)| {
                        CompletedPart::builder()
                            .part_number(number)
                            .e_tag(etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                StorageError::Remote(format!("Failed to complete multipart upload {}: {}", key, e))
            })?;

        Ok(())
    }

    pub async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| {
                StorageError::Remote(format!("Failed to abort multipart upload {}: {}", key, e))
            })?;

        Ok(())
    }
}

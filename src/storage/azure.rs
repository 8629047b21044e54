//! Azure Blob Storage backend
//!
//! Parts are staged as uncommitted blocks of a block blob (Put Block) and
//! committed with Put Block List. Requests are authorized with a SAS token
//! appended to the query string.
//!
//! Block ids carry the upload id, so two uploads staging blocks on one blob
//! never see or commit each other's blocks. Every block is sent with its
//! `Content-MD5` and the service rejects a corrupted body.

use base64::Engine;
use md5::{Digest, Md5};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::AzureConfig;

use super::{
    compute_checksum, normalize_object_path, verify_remote_parts, BackendHandle, BackendKind,
    PartReceipt, RemotePart, StorageAdapter, StorageError,
};

const API_VERSION: &str = "2021-08-06";

pub struct AzureBlobStorage {
    http: reqwest::Client,
    container_url: String,
    sas_token: String,
}

impl AzureBlobStorage {
    pub fn new(config: &AzureConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            container_url: config.container_url.trim_end_matches('/').to_string(),
            sas_token: config.sas_token.clone(),
        }
    }

    fn blob_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.container_url, encoded.join("/"))
    }

    fn signed_url(&self, key: &str, query: &str) -> String {
        format!("{}?{}&{}", self.blob_url(key), query, self.sas_token)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, StorageError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Remote(format!(
            "{} failed with {}: {}",
            what,
            status,
            body.chars().take(200).collect::<String>()
        )))
    }

    async fn uncommitted_blocks(
        &self,
        upload_id: Uuid,
        key: &str,
    ) -> Result<Vec<RemotePart>, StorageError> {
        let response = self
            .http
            .get(self.signed_url(key, "comp=blocklist&blocklisttype=uncommitted"))
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("Get Block List: {}", e)))?;

        let body = Self::check(response, "Get Block List")
            .await?
            .text()
            .await
            .map_err(|e| StorageError::Remote(format!("Get Block List body: {}", e)))?;

        parse_block_list(upload_id, &body)
    }
}

/// Base64 block id for a part of one upload. Ids within a blob must all
/// have the same length: 32 hex digits, a dash and 8 digits.
pub fn block_id(upload_id: Uuid, part_id: u32) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(format!("{}-{:08}", upload_id.simple(), part_id))
}

fn part_id_from_block(upload_id: Uuid, id: &str) -> Option<u32> {
    let raw = base64::engine::general_purpose::STANDARD.decode(id).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let (owner, part) = text.split_once('-')?;
    if owner != upload_id.simple().to_string() || part.len() != 8 {
        return None;
    }
    part.parse().ok()
}

fn content_md5(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(data))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockListXml {
    #[serde(default)]
    uncommitted_blocks: BlockSetXml,
}

#[derive(Debug, Default, Deserialize)]
struct BlockSetXml {
    #[serde(rename = "Block", default)]
    blocks: Vec<BlockXml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockXml {
    name: String,
    size: u64,
}

/// Parse a Get Block List response; blocks staged by other uploads are
/// ignored
pub fn parse_block_list(upload_id: Uuid, xml: &str) -> Result<Vec<RemotePart>, StorageError> {
    let list: BlockListXml = quick_xml::de::from_str(xml)
        .map_err(|e| StorageError::Remote(format!("Malformed block list: {}", e)))?;

    Ok(list
        .uncommitted_blocks
        .blocks
        .into_iter()
        .filter_map(|b| {
            Some(RemotePart {
                part_id: part_id_from_block(upload_id, &b.name)?,
                size: b.size,
                etag: None,
            })
        })
        .collect())
}

/// Body for Put Block List
pub fn block_list_body(upload_id: Uuid, parts: &[PartReceipt]) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for part in parts {
        body.push_str("<Latest>");
        body.push_str(&block_id(upload_id, part.part_id));
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

#[async_trait::async_trait]
impl StorageAdapter for AzureBlobStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }

    fn min_part_size(&self) -> u64 {
        1
    }

    /// Nothing is allocated until the first block arrives
    async fn prepare(
        &self,
        upload_id: Uuid,
        object_path: &str,
    ) -> Result<BackendHandle, StorageError> {
        Ok(BackendHandle {
            upload_id,
            kind: BackendKind::Azure,
            key: normalize_object_path(object_path)?,
            remote_id: None,
        })
    }

    async fn write_part(
        &self,
        handle: &BackendHandle,
        part_id: u32,
        data: &[u8],
    ) -> Result<PartReceipt, StorageError> {
        let query = format!(
            "comp=block&blockid={}",
            urlencoding::encode(&block_id(handle.upload_id, part_id))
        );

        let response = self
            .http
            .put(self.signed_url(&handle.key, &query))
            .header("x-ms-version", API_VERSION)
            .header("content-md5", content_md5(data))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("Put Block: {}", e)))?;

        Self::check(response, "Put Block").await?;

        tracing::debug!(
            upload_id = %handle.upload_id,
            part_id = part_id,
            size = data.len(),
            "Staged Azure block"
        );

        Ok(PartReceipt {
            part_id,
            size: data.len() as u64,
            checksum: compute_checksum(data),
            etag: None,
        })
    }

    async fn commit(
        &self,
        handle: &BackendHandle,
        parts: &[PartReceipt],
    ) -> Result<String, StorageError> {
        let staged = self.uncommitted_blocks(handle.upload_id, &handle.key).await?;
        verify_remote_parts(parts, &staged, self.min_part_size())?;

        let response = self
            .http
            .put(self.signed_url(&handle.key, "comp=blocklist"))
            .header("x-ms-version", API_VERSION)
            .header("content-type", "application/xml")
            .body(block_list_body(handle.upload_id, parts))
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("Put Block List: {}", e)))?;

        Self::check(response, "Put Block List").await?;

        tracing::info!(
            upload_id = %handle.upload_id,
            key = %handle.key,
            parts = parts.len(),
            "Committed Azure block list"
        );

        Ok(self.blob_url(&handle.key))
    }

    /// Uncommitted blocks cannot be deleted one by one; the service drops
    /// them a week after staging
    async fn abort(&self, handle: &BackendHandle) {
        tracing::debug!(
            upload_id = %handle.upload_id,
            key = %handle.key,
            "Leaving uncommitted Azure blocks to expire"
        );
    }
}

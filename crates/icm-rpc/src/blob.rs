//! Blob storage for payloads too large to inline in an RPC body.

use crate::error::RpcError;
use async_trait::async_trait;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, RpcError>;
    async fn download(&self, handle: &str) -> Result<Vec<u8>, RpcError>;
}

/// Uploads/downloads blobs through pre-signed URLs handed out by the
/// control plane, the same two-step dance the host platform uses: a POST to
/// mint a URL, then a direct PUT/GET against blob storage.
pub struct HttpBlobStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(base_url: String) -> Self {
        Self { http: reqwest::Client::new(), base_url }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, RpcError> {
        #[derive(serde::Deserialize)]
        struct UploadUrlResponse {
            blob_id: String,
            upload_url: String,
        }

        let minted: UploadUrlResponse = self
            .http
            .post(format!("{}/blobs", self.base_url))
            .json(&serde_json::json!({ "contentLength": bytes.len() }))
            .send()
            .await?
            .json()
            .await?;

        let put = self.http.put(&minted.upload_url).body(bytes).send().await?;
        if !put.status().is_success() {
            return Err(RpcError::Status {
                status: put.status().as_u16(),
                body: "blob upload failed".to_string(),
            });
        }
        Ok(minted.blob_id)
    }

    async fn download(&self, handle: &str) -> Result<Vec<u8>, RpcError> {
        let response = self
            .http
            .get(format!("{}/blobs/{}", self.base_url, handle))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RpcError::BlobNotFound(handle.to_string()));
        }
        if !response.status().is_success() {
            return Err(RpcError::Status {
                status: response.status().as_u16(),
                body: "blob download failed".to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

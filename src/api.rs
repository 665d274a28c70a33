//! HTTP contract consumed by the transport manager, stability verifier and
//! finalize coordinator.
//!
//! The engine treats every call as an opaque async operation; routing and
//! auth live entirely in `HttpUploadApi`. The trait exists so tests can run
//! against an in-memory mock.

use crate::error::UploadError;
use crate::models::{SessionId, UploadType};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body for starting a transfer session.
#[derive(Debug, Clone, Serialize)]
pub struct InitiateRequest {
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub upload_type: UploadType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Result of a successful initiate call.
#[derive(Debug, Clone)]
pub struct InitiateOutcome {
    pub session_id: SessionId,
    /// Present for chunked transfers when the backend runs a multipart
    /// upload under the hood.
    pub multipart_upload_id: Option<String>,
}

/// Backend view of a session's durability.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatus {
    pub uploaded_size: u64,
    pub expected_size: u64,
    pub object_exists: bool,
}

/// Per-item payload for the finalize call.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeRequest {
    pub session_id: SessionId,
    pub title: String,
    pub filename: String,
    pub category_id: String,
    pub metadata: HashMap<String, String>,
}

/// Asset catalog record returned by a successful finalize.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetRecord {
    pub asset_id: String,
    pub title: String,
    pub filename: String,
}

/// Async boundary to the upload backend (allows mocking for tests).
#[async_trait::async_trait]
pub trait UploadApi: Send + Sync {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateOutcome, UploadError>;

    /// Single-call upload for files below the chunk threshold.
    async fn upload_direct(&self, session: &SessionId, data: Vec<u8>) -> Result<(), UploadError>;

    /// One part of a chunked transfer; parts are 1-based and sequential.
    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<(), UploadError>;

    async fn complete(&self, session: &SessionId) -> Result<(), UploadError>;

    async fn status(&self, session: &SessionId) -> Result<SessionStatus, UploadError>;

    async fn finalize(&self, request: &FinalizeRequest) -> Result<AssetRecord, UploadError>;
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    session_id: String,
    multipart_upload_id: Option<String>,
}

/// Production client for the dashboard's upload service.
#[derive(Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpUploadApi {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_token,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Turn a non-success response into a classified error, using the body
    /// text as the message when the backend sent one.
    async fn classify(response: reqwest::Response) -> UploadError {
        let status = response.status().as_u16();
        let message = match response.text().await {
            Ok(body) if !body.trim().is_empty() => body,
            _ => format!("request failed with status {}", status),
        };
        UploadError::from_status(status, message)
    }
}

#[async_trait::async_trait]
impl UploadApi for HttpUploadApi {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateOutcome, UploadError> {
        let url = format!("{}/uploads", self.base_url);
        let response = self
            .request(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }

        let body: InitiateResponse = response
            .json()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        Ok(InitiateOutcome {
            session_id: SessionId::new(body.session_id),
            multipart_upload_id: body.multipart_upload_id,
        })
    }

    async fn upload_direct(&self, session: &SessionId, data: Vec<u8>) -> Result<(), UploadError> {
        let url = format!("{}/uploads/{}/content", self.base_url, session);
        let response = self
            .request(self.client.put(&url))
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response).await)
        }
    }

    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<(), UploadError> {
        let url = format!("{}/uploads/{}/parts/{}", self.base_url, session, part_number);
        let response = self
            .request(self.client.put(&url))
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response).await)
        }
    }

    async fn complete(&self, session: &SessionId) -> Result<(), UploadError> {
        let url = format!("{}/uploads/{}/complete", self.base_url, session);
        let response = self
            .request(self.client.post(&url))
            .send()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response).await)
        }
    }

    async fn status(&self, session: &SessionId) -> Result<SessionStatus, UploadError> {
        let url = format!("{}/uploads/{}/status", self.base_url, session);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| UploadError::from_transport(&e))
    }

    async fn finalize(&self, request: &FinalizeRequest) -> Result<AssetRecord, UploadError> {
        let url = format!("{}/uploads/{}/finalize", self.base_url, request.session_id);
        let response = self
            .request(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(|e| UploadError::from_transport(&e))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| UploadError::from_transport(&e))
    }
}

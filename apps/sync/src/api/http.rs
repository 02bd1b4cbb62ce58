//! reqwest-backed implementation of the draft, list and replay collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{
    draft_endpoint, ApiError, DraftApi, RecordApi, ReplayTransport, SavedDraft,
    UpdateDraftRequest,
};
use crate::collection::{ListQuery, RecordPage};
use crate::models::{Document, VersionMarker};
use crate::queue::{OperationKind, QueuedOperation};

/// Error envelope returned by the API: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
    /// Present on 409 responses: the marker the server currently holds.
    #[serde(flatten)]
    current: Option<VersionMarker>,
}

#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
            token,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(endpoint));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends the request and maps transport failures and non-2xx statuses
    /// onto [`ApiError`].
    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let envelope = serde_json::from_str::<ErrorEnvelope>(&body).ok();

        if status == StatusCode::CONFLICT {
            let (message, server_marker) = match envelope {
                Some(e) => (e.error.message, e.error.current),
                None => ("document was modified elsewhere".to_string(), None),
            };
            warn!("API reported conflict: {message}");
            return Err(ApiError::Conflict {
                message,
                server_marker,
            });
        }

        let message = match envelope {
            Some(e) => match e.error.code {
                Some(code) => format!("{code}: {}", e.error.message),
                None => e.error.message,
            },
            None => body,
        };
        warn!("API returned {status}: {message}");
        Err(ApiError::Server {
            status: status.as_u16(),
            message,
        })
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl DraftApi for HttpApi {
    async fn create_draft(&self, content: &Value) -> Result<SavedDraft, ApiError> {
        let body = serde_json::json!({ "content": content });
        let response = self
            .send(self.request(Method::POST, "/drafts").json(&body))
            .await?;
        let saved: SavedDraft = Self::read_json(response).await?;
        debug!("Created draft {} at version {}", saved.id, saved.marker.version);
        Ok(saved)
    }

    async fn update_draft(
        &self,
        id: Uuid,
        request: &UpdateDraftRequest,
    ) -> Result<SavedDraft, ApiError> {
        let response = self
            .send(
                self.request(Method::PUT, &draft_endpoint(id))
                    .json(request),
            )
            .await?;
        let saved: SavedDraft = Self::read_json(response).await?;
        debug!("Updated draft {id} to version {}", saved.marker.version);
        Ok(saved)
    }

    async fn fetch_draft(&self, id: Uuid) -> Result<Document, ApiError> {
        let response = self
            .send(self.request(Method::GET, &draft_endpoint(id)))
            .await?;
        Self::read_json(response).await
    }
}

#[async_trait]
impl RecordApi for HttpApi {
    async fn list_records(&self, query: &ListQuery) -> Result<RecordPage, ApiError> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", query.page.to_string()),
            ("pageSize", query.page_size.to_string()),
            ("sort", query.sort.field.as_str().to_string()),
            ("order", query.sort.direction.as_str().to_string()),
            ("deleted", query.filter.deleted.as_str().to_string()),
        ];
        if let Some(folder) = query.filter.folder_id {
            params.push(("folderId", folder.to_string()));
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            params.push(("search", search.trim().to_string()));
        }

        let response = self
            .send(self.request(Method::GET, "/files").query(&params))
            .await?;
        Self::read_json(response).await
    }
}

#[async_trait]
impl ReplayTransport for HttpApi {
    async fn replay(&self, operation: &QueuedOperation) -> Result<Option<Value>, ApiError> {
        let method = match operation.kind {
            OperationKind::Save => Method::PUT,
            OperationKind::Update => Method::PATCH,
            OperationKind::Delete => Method::DELETE,
        };
        let mut builder = self.request(method, &operation.endpoint);
        if !operation.payload.is_null() {
            builder = builder.json(&operation.payload);
        }

        let response = self.send(builder).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

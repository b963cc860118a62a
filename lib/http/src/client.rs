//! reqwest-based backend client.

use crate::config::HttpBackendConfig;
use crate::error::{HttpError, status_error, transport_error};
use async_trait::async_trait;
use counsel_conversation::{
    AnalysisLookup, ChatBackend, ChatRequest, ChatResponse, ConversationRemote, RemoteError,
    RemoteMessage, RemoteSession,
};
use counsel_core::{AnalysisId, RemoteSessionId, UserId};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Serialize)]
struct TitleBody<'a> {
    title: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SituationAnalysisBody {
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractAnalysisBody {
    #[serde(default)]
    document_ids: Vec<AnalysisId>,
}

/// Client for the analysis backend's conversation, analysis and chat APIs.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpBackend {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(config: &HttpBackendConfig) -> counsel_core::Result<Self, HttpError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| HttpError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(HttpError::InvalidBaseUrl {
                url: config.base_url.clone(),
                reason: "URL cannot carry a path".to_string(),
            }
            .into());
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| HttpError::ClientBuild {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            bearer_token: config.bearer_token.clone(),
        })
    }

    /// Resolves path segments against the base URL, escaping each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, resource: &str) -> Result<Response, RemoteError> {
        let response = builder.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(resource, status = status.as_u16(), "backend returned an error status");
        Err(status_error(status, body, resource))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        resource: &str,
    ) -> Result<T, RemoteError> {
        let response = self.execute(builder, resource).await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ConversationRemote for HttpBackend {
    #[instrument(skip(self, title), fields(user = %user_id))]
    async fn create_session(
        &self,
        user_id: &UserId,
        title: &str,
    ) -> Result<RemoteSession, RemoteError> {
        let url = self.endpoint(&["users", user_id.as_str(), "conversations"]);
        let resource = url.path().to_string();
        let builder = self.request(Method::POST, url).json(&TitleBody { title });
        self.fetch(builder, &resource).await
    }

    #[instrument(skip(self), fields(user = %user_id))]
    async fn list_sessions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<RemoteSession>, RemoteError> {
        let url = self.endpoint(&["users", user_id.as_str(), "conversations"]);
        let resource = url.path().to_string();
        let builder = self.request(Method::GET, url).query(&[("limit", limit)]);
        self.fetch(builder, &resource).await
    }

    #[instrument(skip(self), fields(remote_session = %id))]
    async fn get_session(&self, id: &RemoteSessionId) -> Result<RemoteSession, RemoteError> {
        let url = self.endpoint(&["conversations", id.as_str()]);
        let resource = url.path().to_string();
        self.fetch(self.request(Method::GET, url), &resource).await
    }

    #[instrument(skip(self, title), fields(remote_session = %id))]
    async fn update_title(&self, id: &RemoteSessionId, title: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&["conversations", id.as_str()]);
        let resource = url.path().to_string();
        let builder = self.request(Method::PATCH, url).json(&TitleBody { title });
        self.execute(builder, &resource).await.map(drop)
    }

    #[instrument(skip(self), fields(remote_session = %id))]
    async fn delete_session(&self, id: &RemoteSessionId) -> Result<(), RemoteError> {
        let url = self.endpoint(&["conversations", id.as_str()]);
        let resource = url.path().to_string();
        self.execute(self.request(Method::DELETE, url), &resource)
            .await
            .map(drop)
    }

    #[instrument(
        skip(self, message),
        fields(remote_session = %id, sequence = message.sequence_number)
    )]
    async fn append_message(
        &self,
        id: &RemoteSessionId,
        message: &RemoteMessage,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&["conversations", id.as_str(), "messages"]);
        let resource = url.path().to_string();
        let builder = self.request(Method::POST, url).json(message);
        self.execute(builder, &resource).await.map(drop)
    }

    #[instrument(skip(self), fields(remote_session = %id))]
    async fn list_messages(&self, id: &RemoteSessionId) -> Result<Vec<RemoteMessage>, RemoteError> {
        let url = self.endpoint(&["conversations", id.as_str(), "messages"]);
        let resource = url.path().to_string();
        self.fetch(self.request(Method::GET, url), &resource).await
    }
}

#[async_trait]
impl AnalysisLookup for HttpBackend {
    #[instrument(skip(self), fields(situation = %id))]
    async fn situation_summary(&self, id: &AnalysisId) -> Result<String, RemoteError> {
        let url = self.endpoint(&["situation-analyses", id.as_str()]);
        let resource = url.path().to_string();
        let body: SituationAnalysisBody =
            self.fetch(self.request(Method::GET, url), &resource).await?;
        Ok(body.summary)
    }

    #[instrument(skip(self), fields(contract = %id))]
    async fn contract_documents(&self, id: &AnalysisId) -> Result<Vec<AnalysisId>, RemoteError> {
        let url = self.endpoint(&["contract-analyses", id.as_str()]);
        let resource = url.path().to_string();
        let body: ContractAnalysisBody =
            self.fetch(self.request(Method::GET, url), &resource).await?;
        Ok(body.document_ids)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    #[instrument(skip(self, request), fields(context_type = %request.context_type))]
    async fn answer(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError> {
        let url = self.endpoint(&["chat"]);
        let resource = url.path().to_string();
        let builder = self.request(Method::POST, url).json(request);
        self.fetch(builder, &resource).await
    }
}

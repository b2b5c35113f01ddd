use anyhow::{bail, Context, Result};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::mux::SessionSummary;
use crate::status::{StatusEvent, StatusUpdate};
use crate::web::api::{CreateSessionRequest, CreateSessionResponse, NotifyResponse};

/// HTTP client for the admin API.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl ApiClient {
    pub fn new(server: &str, token: &str) -> Result<Self> {
        let base = Url::parse(server).with_context(|| format!("Invalid server URL: {}", server))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token: token.to_string(),
        })
    }

    /// `path` on the server with the token attached.
    pub fn url(&self, path: &str) -> Result<Url> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    /// WebSocket URL for `path`: same host, ws/wss scheme.
    pub fn ws_url(&self, path: &str) -> Result<Url> {
        let mut url = self.url(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        if url.set_scheme(scheme).is_err() {
            bail!("Cannot derive a WebSocket URL from {}", self.base);
        }
        Ok(url)
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = body["message"].as_str().unwrap_or("no details");
            bail!("Server returned {}: {}", status, message);
        }
        Ok(resp.json().await?)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        self.request::<(), _>(Method::GET, "/api/sessions", None).await
    }

    pub async fn create(
        &self,
        working_directory: Option<String>,
        session_id: Option<String>,
    ) -> Result<String> {
        let body = CreateSessionRequest {
            working_directory,
            session_id,
        };
        let resp: CreateSessionResponse = self
            .request(Method::POST, "/api/sessions", Some(&body))
            .await?;
        Ok(resp.session_id)
    }

    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        let path = format!("/api/sessions/{}", session_id);
        let _: serde_json::Value = self.request::<(), _>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn update_status(&self, update: &StatusUpdate) -> Result<StatusEvent> {
        self.request(Method::POST, "/api/status", Some(update)).await
    }

    pub async fn notify(&self, scope: &str, payload: &serde_json::Value) -> Result<usize> {
        let path = format!("/api/scopes/{}/notify", scope);
        let resp: NotifyResponse = self.request(Method::POST, &path, Some(payload)).await?;
        Ok(resp.delivered)
    }
}

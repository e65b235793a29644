use async_trait::async_trait;
use serde_json::Value;
use std::sync::RwLock;
use tracing::debug;

use crate::auth::Session;
use crate::error::{BackendError, Result};
use crate::query::SelectQuery;

const REST_PATH: &str = "rest/v1";

/// Row-level operations the hosted backend exposes
///
/// One call is one HTTP round trip. Nothing here retries or batches;
/// whatever the backend says goes straight back to the caller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Select rows from `table` (an empty query selects everything)
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>>;

    /// Insert one row and return it as stored
    async fn insert(&self, table: &str, row: &Value) -> Result<Value>;

    /// Patch the row with `id` and return the updated row
    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<Value>;

    async fn delete(&self, table: &str, id: &str) -> Result<()>;
}

/// HTTP client for the hosted data + auth service
pub struct BackendClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) anon_key: String,
    pub(crate) session: RwLock<Option<Session>>,
}

impl BackendClient {
    /// `base_url` is the project root, e.g. `https://xyz.example.co`
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("tradepost/0.1.0"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
        })
    }

    /// Restore a session saved by an earlier run
    pub fn with_session(self, session: Option<Session>) -> Self {
        self.set_session(session);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        if let Ok(mut guard) = self.session.write() {
            *guard = session;
        }
    }

    /// Bearer token: the signed-in user's access token, else the anon key
    pub(crate) fn bearer(&self) -> String {
        self.session()
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            REST_PATH,
            urlencoding::encode(table)
        )
    }

    pub(crate) fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }

    /// Turn a response into JSON or the backend's error, verbatim
    pub(crate) async fn read_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BackendError::from_body(status.as_u16(), &body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Writes come back as a one-element array with `return=representation`
    fn first_row(table: &str, id: Option<&str>, value: Value) -> Result<Value> {
        match value {
            Value::Array(mut rows) => {
                if rows.is_empty() {
                    Err(BackendError::NotFound(match id {
                        Some(id) => format!("{}/{}", table, id),
                        None => table.to_string(),
                    }))
                } else {
                    Ok(rows.swap_remove(0))
                }
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>> {
        debug!("GET {} {:?}", table, query.to_params());

        let request = self
            .client
            .get(self.table_url(table))
            .query(&query.to_params());
        let response = self.authorize(request).send().await?;

        match Self::read_json(response).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn insert(&self, table: &str, row: &Value) -> Result<Value> {
        debug!("POST {}", table);

        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row);
        let response = self.authorize(request).send().await?;

        Self::first_row(table, None, Self::read_json(response).await?)
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<Value> {
        debug!("PATCH {}/{}", table, id);

        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(patch);
        let response = self.authorize(request).send().await?;

        Self::first_row(table, Some(id), Self::read_json(response).await?)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        debug!("DELETE {}/{}", table, id);

        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        let response = self.authorize(request).send().await?;

        Self::read_json(response).await?;
        Ok(())
    }
}

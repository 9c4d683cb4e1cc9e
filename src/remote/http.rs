//! HTTP implementation of [`RemoteStore`] for the SoliDB document API.

use super::{Document, ListFilter, RemoteStore};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::ids::ServerId;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

const PAGE_SIZE: usize = 500;

pub struct HttpRemoteStore {
    base_url: String,
    database: String,
    token: Option<String>,
    id_field: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, database: &str) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            token: None,
            id_field: "id".to_string(),
            client,
        })
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Field the server `_key` is exposed under in listed documents.
    pub fn with_id_field(mut self, id_field: &str) -> Self {
        self.id_field = id_field.to_string();
        self
    }

    fn document_path(&self, collection: &str) -> String {
        format!("/_api/database/{}/document/{}", self.database, collection)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transient(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status, &format!("{} {}: {}", method, path, text)));
        }

        if text.is_empty() {
            return Ok(Value::Null);
        }

        // A 2xx with a body we cannot read is not going to improve on retry
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Validation(format!("Failed to parse response: {} - Text: {}", e, text)))
    }

    fn normalize(&self, value: Value) -> Option<Document> {
        let mut doc = match value {
            Value::Object(map) => map,
            _ => return None,
        };
        if let Some(key) = doc.get("_key").cloned() {
            doc.insert(self.id_field.clone(), key);
        }
        Some(doc)
    }

    async fn list_all(&self, resource_key: &str) -> Result<Vec<Document>, RemoteError> {
        let mut documents = Vec::new();
        let mut offset = 0;

        loop {
            let path = format!(
                "/_api/database/{}/collection/{}/documents?limit={}&offset={}",
                self.database, resource_key, PAGE_SIZE, offset
            );
            let response = self.request(Method::GET, &path, None).await?;
            let page = response
                .get("documents")
                .and_then(|d| d.as_array())
                .cloned()
                .unwrap_or_default();

            let count = page.len();
            documents.extend(page.into_iter().filter_map(|v| self.normalize(v)));

            if count < PAGE_SIZE {
                break;
            }
            offset += count;
        }

        Ok(documents)
    }

    async fn list_filtered(
        &self,
        resource_key: &str,
        filter: &ListFilter,
    ) -> Result<Vec<Document>, RemoteError> {
        let (sdbql, bind_vars) = filter_query(resource_key, filter)?;
        let payload = json!({
            "database": self.database,
            "sdbql": sdbql,
            "bind_vars": bind_vars,
        });

        let response = self.request(Method::POST, "/_api/query", Some(&payload)).await?;
        Ok(response
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| self.normalize(v))
            .collect())
    }
}

/// Build the SDBQL text for a filtered list. Values are bound; the
/// collection and field names are checked since they end up in the text.
fn filter_query(
    resource_key: &str,
    filter: &ListFilter,
) -> Result<(String, serde_json::Map<String, Value>), RemoteError> {
    if resource_key.is_empty()
        || !resource_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(RemoteError::Validation(format!(
            "Invalid collection name '{}'",
            resource_key
        )));
    }

    let mut bind_vars = serde_json::Map::new();
    let mut clauses = Vec::new();
    for (i, (field, value)) in filter.iter().enumerate() {
        if field.is_empty() || field.contains('`') {
            return Err(RemoteError::Validation(format!(
                "Invalid filter field '{}'",
                field
            )));
        }
        let name = format!("f{}", i);
        clauses.push(format!("doc.`{}` == @{}", field, name));
        bind_vars.insert(name, value.clone());
    }

    let sdbql = format!(
        "FOR doc IN {} FILTER {} RETURN doc",
        resource_key,
        clauses.join(" AND ")
    );
    Ok((sdbql, bind_vars))
}

/// Map an HTTP failure onto the engine's retry taxonomy.
pub fn classify_status(status: StatusCode, detail: &str) -> RemoteError {
    let message = format!("HTTP {} {}", status.as_u16(), detail);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::Validation(message)
        }
        StatusCode::NOT_FOUND
        | StatusCode::CONFLICT
        | StatusCode::GONE
        | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(message),
        _ => RemoteError::Transient(message),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(&self, resource_key: &str, doc: &Document) -> Result<ServerId, RemoteError> {
        let mut body = doc.clone();
        body.remove(&self.id_field);

        let response = self
            .request(
                Method::POST,
                &self.document_path(resource_key),
                Some(&Value::Object(body)),
            )
            .await?;

        response
            .get("_key")
            .and_then(|k| k.as_str())
            .map(ServerId::from)
            .ok_or_else(|| RemoteError::Validation("No _key in create response".to_string()))
    }

    async fn update(
        &self,
        resource_key: &str,
        id: &ServerId,
        patch: &Document,
    ) -> Result<(), RemoteError> {
        let payload = json!({
            "document": patch,
            "merge": true
        });
        let path = format!("{}/{}", self.document_path(resource_key), id);
        self.request(Method::PUT, &path, Some(&payload)).await?;
        Ok(())
    }

    async fn delete(&self, resource_key: &str, id: &ServerId) -> Result<(), RemoteError> {
        let path = format!("{}/{}", self.document_path(resource_key), id);
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn list(
        &self,
        resource_key: &str,
        filter: Option<&ListFilter>,
    ) -> Result<Vec<Document>, RemoteError> {
        match filter {
            Some(f) if !f.is_empty() => self.list_filtered(resource_key, f).await,
            _ => self.list_all(resource_key).await,
        }
    }
}

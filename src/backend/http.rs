use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::RemoteBackend;
use crate::config::BackendConfig;
use crate::error::{Result, SyncError};

/// Remote backend over a PostgREST-style REST API with object storage.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| SyncError::Internal("backend url is not configured".to_string()))?;
        Self::new(
            url,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path)
    }

    fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(SyncError::Backend {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn insert(&self, table: &str, row: &Value) -> Result<()> {
        debug!("POST {}", self.table_url(table));
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(row)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<()> {
        debug!("PATCH {} id={}", self.table_url(table), id);
        let response = self
            .authorized(self.client.patch(self.table_url(table)))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        debug!("DELETE {} id={}", self.table_url(table), id);
        let response = self
            .authorized(self.client.delete(self.table_url(table)))
            .query(&[("id", format!("eq.{}", id))])
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn invoke(&self, function: &str, payload: &Value) -> Result<Value> {
        debug!("POST {}", self.rpc_url(function));
        let response = self
            .authorized(self.client.post(self.rpc_url(function)))
            .json(payload)
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        debug!("Uploading {} bytes to {}/{}", bytes.len(), bucket, path);
        let response = self
            .authorized(self.client.post(self.object_url(bucket, path)))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes.to_vec())
            .send()
            .await?;
        check_status(response).await?;
        Ok(self.public_object_url(bucket, path))
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authorized(self.client.get(format!("{}/rest/v1/", self.base_url)))
            .send()
            .await?;
        if response.status().is_server_error() {
            return Err(SyncError::Backend {
                status: response.status().as_u16(),
                message: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpBackend {
        HttpBackend::new("https://field.example.test/", None, Duration::from_secs(5))
            .expect("client")
    }

    #[test]
    fn builds_rest_urls_without_double_slashes() {
        let backend = backend();
        assert_eq!(
            backend.table_url("trees"),
            "https://field.example.test/rest/v1/trees"
        );
        assert_eq!(
            backend.rpc_url("complete_task"),
            "https://field.example.test/rest/v1/rpc/complete_task"
        );
    }

    #[test]
    fn upload_urls_are_deterministic() {
        let backend = backend();
        assert_eq!(
            backend.object_url("field-photos", "a1/photo-1"),
            "https://field.example.test/storage/v1/object/field-photos/a1/photo-1"
        );
        assert_eq!(
            backend.public_object_url("field-photos", "a1/photo-1"),
            "https://field.example.test/storage/v1/object/public/field-photos/a1/photo-1"
        );
    }

    #[test]
    fn from_config_requires_url() {
        let config = BackendConfig::default();
        assert!(HttpBackend::from_config(&config).is_err());

        let config = BackendConfig {
            url: Some("https://field.example.test".to_string()),
            ..BackendConfig::default()
        };
        assert!(HttpBackend::from_config(&config).is_ok());
    }
}

//! Remote backend boundary.
//!
//! The sync engine only needs a relational data store (row insert, update,
//! delete by id), callable server functions, and object storage for
//! attachments. [`HttpBackend`] speaks a PostgREST-style REST API; tests use
//! the recording mock in [`crate::test_utils`].

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert a row. `row` carries its own primary key; a row whose key
    /// already exists is ignored so redelivery is harmless.
    async fn insert(&self, table: &str, row: &Value) -> Result<()>;

    /// Patch the row identified by `id`.
    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<()>;

    /// Delete the row identified by `id`. Deleting a missing row succeeds.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Invoke a named server function and return its JSON result.
    async fn invoke(&self, function: &str, payload: &Value) -> Result<Value>;

    /// Upload an object, overwriting any previous object at `path`, and
    /// return its stable URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String>;

    /// Lightweight reachability check used by the connectivity heartbeat.
    async fn ping(&self) -> Result<()>;
}

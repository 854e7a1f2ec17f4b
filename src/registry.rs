//! Schema registry client (Confluent-compatible)
//!
//! The mapper depends on a small capability: register an Avro schema under a
//! subject and get back the stable integer id the registry assigned. The
//! HTTP client talks the Confluent API; JSON mode supplies the no-op
//! implementation instead, since raw JSON messages carry no schema ids.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability the table mapper depends on for Avro schema registration.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register `schema_json` under `subject`, returning the schema id.
    async fn register(&self, subject: &str, schema_json: &str) -> Result<u32>;
}

#[derive(Debug, Serialize)]
struct RegisterSchemaRequest<'a> {
    schema: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterSchemaResponse {
    id: u32,
}

/// HTTP client for a Confluent-compatible schema registry.
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::registry(format!("failed to build HTTP client: {}", e)))?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn register(&self, subject: &str, schema_json: &str) -> Result<u32> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, REGISTRY_CONTENT_TYPE)
            .json(&RegisterSchemaRequest {
                schema: schema_json,
            })
            .send()
            .await
            .map_err(|e| {
                BridgeError::registry(format!("request to {} failed: {}", url, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::registry(format!(
                "registering subject {} failed ({}): {}",
                subject, status, body
            )));
        }

        let parsed: RegisterSchemaResponse = response.json().await.map_err(|e| {
            BridgeError::registry(format!("invalid response for subject {}: {}", subject, e))
        })?;

        debug!(subject, schema_id = parsed.id, "registered schema");
        Ok(parsed.id)
    }
}

/// No-op registry for JSON output mode.
///
/// JSON messages carry no schema-id header, so every registration resolves
/// to id 0 without any network traffic.
#[derive(Debug, Default)]
pub struct NullRegistry;

#[async_trait]
impl SchemaRegistry for NullRegistry {
    async fn register(&self, _subject: &str, _schema_json: &str) -> Result<u32> {
        Ok(0)
    }
}

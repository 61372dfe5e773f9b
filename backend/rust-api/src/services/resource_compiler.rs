use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::models::{Source, Variables};

/// Authored resource, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, version: Option<String>) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

/// Turns authored resources into executable sources.
#[async_trait]
pub trait ResourceCompiler: Send + Sync {
    /// `Ok(None)` when the resource does not exist.
    async fn compile(&self, resource: &ResourceRef, overrides: &Variables) -> Result<Option<Source>>;

    async fn get_title(&self, resource: &ResourceRef) -> Result<Option<String>>;

    async fn is_previewable(&self, resource: &ResourceRef) -> Result<bool>;
}

#[derive(Debug, Serialize)]
struct CompileRequest<'a> {
    resource: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    overrides: &'a Variables,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceMetadata {
    title: Option<String>,
    #[serde(default)]
    previewable: bool,
}

const COMPILER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpResourceCompiler {
    client: Client,
    base_url: String,
}

impl HttpResourceCompiler {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn metadata(&self, resource: &ResourceRef) -> Result<Option<ResourceMetadata>> {
        let url = format!("{}/internal/resources/{}", self.base_url, resource.id);
        let mut request = self.client.get(&url).timeout(COMPILER_TIMEOUT);
        if let Some(version) = &resource.version {
            request = request.query(&[("version", version)]);
        }

        let response = request
            .send()
            .await
            .context("Failed to call resources API")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Resources API returned error {}: {}", status, error_text));
        }

        let metadata = response
            .json()
            .await
            .context("Failed to parse resource metadata")?;
        Ok(Some(metadata))
    }
}

#[async_trait]
impl ResourceCompiler for HttpResourceCompiler {
    async fn compile(&self, resource: &ResourceRef, overrides: &Variables) -> Result<Option<Source>> {
        let url = format!("{}/internal/compile", self.base_url);
        let payload = CompileRequest {
            resource: &resource.id,
            version: resource.version.as_deref(),
            overrides,
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(COMPILER_TIMEOUT)
            .send()
            .await
            .context("Failed to call resource compiler")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Resource compiler returned error {}: {}",
                status,
                error_text
            ));
        }

        let mut source: Source = response
            .json()
            .await
            .context("Failed to parse compiled source")?;
        if source.resource.is_none() {
            source.resource = Some(resource.id.clone());
        }
        if source.version.is_none() {
            source.version = resource.version.clone();
        }
        Ok(Some(source))
    }

    async fn get_title(&self, resource: &ResourceRef) -> Result<Option<String>> {
        Ok(self.metadata(resource).await?.and_then(|metadata| metadata.title))
    }

    async fn is_previewable(&self, resource: &ResourceRef) -> Result<bool> {
        Ok(self
            .metadata(resource)
            .await?
            .map(|metadata| metadata.previewable)
            .unwrap_or(false))
    }
}

//! HTTP clients for the remote execution layer.
//!
//! `HttpExecutionClient` submits jobs, `HttpRemoteReader` lists confirmed
//! records. Both talk JSON to the same service API.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::clients::{
    ExecutionClient, ExecutionContext, ExecutionError, RemoteQuery, RemoteReader, RemoteRecord,
};
use super::models::JobKind;

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    payload: &'a Value,
    context: &'a ExecutionContext,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    remote_id: String,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    records: Vec<RemoteRecord>,
}

/// Map a non-success HTTP status to an execution error class.
fn classify_status(status: StatusCode, body: String) -> ExecutionError {
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };
    match status.as_u16() {
        400 | 422 => ExecutionError::Validation(message),
        403 | 409 => ExecutionError::Rejected(message),
        408 => ExecutionError::Timeout(message),
        _ => ExecutionError::Transport(message),
    }
}

/// Client submitting jobs to the remote execution service.
#[derive(Clone)]
pub struct HttpExecutionClient {
    client: Client,
    base_url: String,
}

impl HttpExecutionClient {
    /// Create a new HttpExecutionClient.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the execution service (e.g., "http://localhost:8080")
    /// * `timeout_secs` - Request timeout in seconds
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the execution service is reachable.
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn submit(
        &self,
        kind: &JobKind,
        payload: &Value,
        context: &ExecutionContext,
    ) -> Result<String, ExecutionError> {
        let url = format!("{}/api/v1/jobs/{}", self.base_url, kind.as_str());
        let response = self
            .client
            .post(&url)
            .json(&SubmitRequest { payload, context })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::Timeout(e.to_string())
                } else {
                    ExecutionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::Transport(format!("Invalid submit response: {}", e)))?;
        Ok(submitted.remote_id)
    }
}

/// Client listing records confirmed by the remote service.
#[derive(Clone)]
pub struct HttpRemoteReader {
    client: Client,
    base_url: String,
}

impl HttpRemoteReader {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteReader for HttpRemoteReader {
    async fn fetch_confirmed(&self, query: &RemoteQuery) -> Result<Vec<RemoteRecord>> {
        let url = format!("{}/api/v1/records", self.base_url);
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(since) = query.since {
            params.push(("since", since.to_string()));
        }
        if let Some(hash) = &query.content_hash {
            params.push(("content_hash", hash.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let response = self.client.get(&url).query(&params).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Records request failed with status: {}",
                response.status()
            ));
        }

        let records: RecordsResponse = response.json().await?;
        Ok(records.records)
    }
}

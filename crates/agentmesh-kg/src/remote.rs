//! Remote backend: a [`TripleStore`] reached over HTTP.
//!
//! Speaks the format in [`crate::wire`] against any endpoint built by
//! [`crate::server::router`]. On top of the in-process error kinds it can fail
//! with `StoreError::Network` and `StoreError::Protocol`.

use crate::query::{BindingRow, Query};
use crate::store::{bounded, TripleStore, Update, UpdateReceipt};
use crate::wire::{ErrorBody, QueryRequest, QueryResponse, UpdateRequest, UpdateResponse, WireUpdate};
use agentmesh_core::StoreError;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteStore {
    client: Client,
    base_url: String,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    async fn post<B, R>(&self, path: &str, body: &B, timeout: Option<Duration>) -> Result<R, StoreError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let mut request = self.client.post(&url).json(body);
        if let Some(limit) = timeout {
            request = request.timeout(limit);
        }
        let response = request.send().await.map_err(|e| transport_error(e, timeout))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| transport_error(e, timeout))?;
        if !status.is_success() {
            return Err(status_error(status, &bytes, timeout));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Protocol(format!("malformed response from {}: {}", url, e)))
    }
}

fn transport_error(e: reqwest::Error, timeout: Option<Duration>) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(timeout.map(|t| t.as_millis() as u64).unwrap_or_default())
    } else {
        StoreError::Network(e.to_string())
    }
}

fn status_error(status: StatusCode, body: &[u8], timeout: Option<Duration>) -> StoreError {
    let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    match status {
        StatusCode::GATEWAY_TIMEOUT => {
            StoreError::Timeout(timeout.map(|t| t.as_millis() as u64).unwrap_or_default())
        }
        StatusCode::BAD_REQUEST => match parsed.and_then(|b| b.position) {
            Some(position) => StoreError::parse(position, message),
            None => StoreError::Protocol(message),
        },
        _ => {
            warn!("remote store returned {}: {}", status, message);
            StoreError::Protocol(format!("{}: {}", status, message))
        }
    }
}

#[async_trait::async_trait]
impl TripleStore for RemoteStore {
    async fn execute_query(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<Vec<BindingRow>, StoreError> {
        let body = QueryRequest {
            query: query.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        let response: QueryResponse = bounded(timeout, self.post("/query", &body, timeout)).await?;
        response.into_rows()
    }

    async fn apply_update(
        &self,
        update: &Update,
        timeout: Option<Duration>,
    ) -> Result<UpdateReceipt, StoreError> {
        let body = UpdateRequest {
            update: WireUpdate::from(update),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        let response: UpdateResponse = bounded(timeout, self.post("/update", &body, timeout)).await?;
        response.into_receipt()
    }

    fn location(&self) -> String {
        self.base_url.clone()
    }
}

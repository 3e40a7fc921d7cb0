//! HTTP adapter for a cell-oriented document service.
//!
//! Endpoints (relative to `base_url`):
//! - `GET  /documents/{id}/cells/{cell}` returns `{"value": "..."}`
//! - `PUT  /documents/{id}/cells/{cell}` with `{"value": "..."}`
//! - `PUT  /documents/{id}` with `{"cells": ["payload", "version"]}` creates the cells

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{envelope_from_cells, Envelope, RemoteStore, StampMinter};
use crate::auth::CredentialProvider;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::snapshot::DomainSnapshot;

const PAYLOAD_CELL: &str = "payload";
const VERSION_CELL: &str = "version";

#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub document_id: String,
    pub timeout_secs: u64,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            document_id: "pipeline".to_string(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CellValue {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateDocument<'a> {
    cells: [&'a str; 2],
}

pub struct HttpRemote {
    config: HttpRemoteConfig,
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    minter: StampMinter,
}

impl HttpRemote {
    pub fn new(
        config: HttpRemoteConfig,
        credentials: Arc<dyn CredentialProvider>,
        writer: impl Into<String>,
        updated_by: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            credentials,
            minter: StampMinter::new(writer, updated_by, clock),
        })
    }

    fn document_url(&self) -> String {
        format!(
            "{}/documents/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.document_id
        )
    }

    fn cell_url(&self, cell: &str) -> String {
        format!("{}/cells/{}", self.document_url(), cell)
    }

    fn bearer(&self) -> Result<String> {
        self.credentials
            .access_token()
            .ok_or_else(|| SyncError::Unauthorized("no access token".to_string()))
    }

    async fn get_cell(&self, cell: &str) -> Result<Option<String>> {
        let token = self.bearer()?;
        let response = self
            .client
            .get(self.cell_url(cell))
            .bearer_auth(token)
            .send()
            .await?;
        let body: CellValue = check_status(response).await?.json().await?;
        Ok(body.value)
    }

    async fn put_cell(&self, cell: &str, value: &str) -> Result<()> {
        let token = self.bearer()?;
        let response = self
            .client
            .put(self.cell_url(cell))
            .bearer_auth(token)
            .json(&CellValue {
                value: Some(value.to_string()),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Map a non-success response onto the sync error taxonomy.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &body))
}

fn classify(status: StatusCode, body: &str) -> SyncError {
    let message = format!("{}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Unauthorized(message),
        StatusCode::NOT_FOUND => SyncError::NotFound(message),
        _ => {
            let lower = body.to_ascii_lowercase();
            if lower.contains("not found") || lower.contains("unable to parse range") {
                SyncError::NotFound(message)
            } else {
                SyncError::Transient(message)
            }
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(&self) -> Result<Option<Envelope>> {
        let payload = self.get_cell(PAYLOAD_CELL).await?;
        if payload.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Ok(None);
        }
        let version = self.get_cell(VERSION_CELL).await?;
        envelope_from_cells(payload.as_deref(), version.as_deref())
    }

    async fn write(&self, snapshot: &DomainSnapshot) -> Result<Envelope> {
        let (raw, envelope) = self.minter.prepare(snapshot)?;
        self.put_cell(PAYLOAD_CELL, &raw).await?;
        self.put_cell(VERSION_CELL, envelope.version.as_str()).await?;
        debug!(
            document = %self.config.document_id,
            version = %envelope.version,
            "Wrote remote document"
        );
        Ok(envelope)
    }

    async fn provision(&self) -> Result<()> {
        let token = self.bearer()?;
        let response = self
            .client
            .put(self.document_url())
            .bearer_auth(token)
            .json(&CreateDocument {
                cells: [PAYLOAD_CELL, VERSION_CELL],
            })
            .send()
            .await?;
        check_status(response).await?;
        debug!(document = %self.config.document_id, "Provisioned remote document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::clock::SystemClock;
    use crate::remote::encode_payload;
    use crate::snapshot::default_stages;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn remote_for(server: &MockServer) -> HttpRemote {
        let creds = Arc::new(StaticCredentials::new(Some("tok".to_string())));
        creds.try_silent().await.unwrap();
        HttpRemote::new(
            HttpRemoteConfig {
                base_url: server.uri(),
                document_id: "board".to_string(),
                timeout_secs: 5,
            },
            creds,
            "proc-a",
            "client_a",
            Arc::new(SystemClock),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_reads_both_cells() {
        let server = MockServer::start().await;
        let snapshot = DomainSnapshot::new(vec![json!({"id": "1"})], default_stages());
        let raw = encode_payload(&snapshot, 1_700_000_000_000, "client_b").unwrap();

        Mock::given(method("GET"))
            .and(path("/documents/board/cells/payload"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": raw })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/documents/board/cells/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "v7" })))
            .mount(&server)
            .await;

        let remote = remote_for(&server).await;
        let envelope = remote.fetch().await.unwrap().unwrap();
        assert_eq!(envelope.version.as_str(), "v7");
        assert_eq!(envelope.updated_by, "client_b");
        assert_eq!(envelope.snapshot, snapshot);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/board/cells/payload"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/documents/board/cells/payload"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Unable to parse range: Sync!A1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/documents/board/cells/payload"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let remote = remote_for(&server).await;
        assert!(remote.fetch().await.unwrap_err().is_unauthorized());
        assert!(remote.fetch().await.unwrap_err().is_not_found());
        assert!(matches!(
            remote.fetch().await.unwrap_err(),
            SyncError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_provision_then_write() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/documents/board"))
            .and(body_json(json!({ "cells": ["payload", "version"] })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/documents/board/cells/payload"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/documents/board/cells/version"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let remote = remote_for(&server).await;
        remote.provision().await.unwrap();
        let envelope = remote
            .write(&DomainSnapshot::new(vec![], default_stages()))
            .await
            .unwrap();
        assert_eq!(envelope.updated_by, "client_a");
        assert!(envelope.version.as_str().contains("-proc-a-"));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized_without_request() {
        let server = MockServer::start().await;
        let remote = HttpRemote::new(
            HttpRemoteConfig {
                base_url: server.uri(),
                ..Default::default()
            },
            Arc::new(StaticCredentials::new(Some("tok".to_string()))),
            "proc-a",
            "client_a",
            Arc::new(SystemClock),
        )
        .unwrap();

        assert!(remote.fetch().await.unwrap_err().is_unauthorized());
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}

//! HTTP client for the offline API.
//!
//! Every request carries the session's `X-API-Key` and `X-CSRFToken`
//! headers when present. Any non-2xx response becomes
//! [`SyncError::Api`] with the status and body.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::session::SessionCredentials;
use crate::types::{InventoryUpdate, MutationRequest};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value};
use tracing::debug;

const API_KEY_HEADER: &str = "X-API-Key";
const CSRF_HEADER: &str = "X-CSRFToken";

/// Snapshot of server data keyed by collection name.
pub type Snapshot = Map<String, Value>;

pub struct OfflineApiClient {
    client: Client,
    base_url: String,
}

impl OfflineApiClient {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Delivers one queued mutation. A 2xx means accepted or already seen.
    pub async fn post_mutation(
        &self,
        request: &MutationRequest<'_>,
        creds: &SessionCredentials,
    ) -> SyncResult<()> {
        let url = self.url("offline/transaction/");
        let resp = authorize(self.client.post(&url), creds)
            .json(request)
            .send()
            .await?;
        check(resp).await?;
        debug!("delivered mutation {}", request.uuid);
        Ok(())
    }

    /// Fetches the reference-data snapshot for a scope (usually a branch).
    pub async fn fetch_snapshot(
        &self,
        scope: &str,
        creds: &SessionCredentials,
    ) -> SyncResult<Snapshot> {
        let url = self.url(&format!("offline/data/{scope}/"));
        let resp = authorize(self.client.get(&url), creds).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Fetches current stock levels for a scope.
    pub async fn fetch_inventory(
        &self,
        scope: &str,
        creds: &SessionCredentials,
    ) -> SyncResult<Vec<InventoryUpdate>> {
        let url = self.url(&format!("offline/inventory/{scope}/"));
        let resp = authorize(self.client.get(&url), creds).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

fn authorize(builder: RequestBuilder, creds: &SessionCredentials) -> RequestBuilder {
    let builder = match &creds.api_key {
        Some(key) => builder.header(API_KEY_HEADER, key),
        None => builder,
    };
    match &creds.csrf_token {
        Some(token) => builder.header(CSRF_HEADER, token),
        None => builder,
    }
}

async fn check(resp: Response) -> SyncResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Api {
        status: status.as_u16(),
        body,
    })
}

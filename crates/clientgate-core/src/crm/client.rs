//! Query client for the CRM REST API.
//!
//! The client issues SOQL queries against
//! `<instanceUrl>/services/data/v<version>/query/` with a bearer token and
//! decodes the `records` array. HTTP goes through a `CrmTransport` so the
//! gateways above it can be exercised without a network.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::CrmError;
use crate::config::CrmConfig;

/// HTTP request timeout in seconds.
/// The gateway timeout normally fires first; this bounds a hung socket.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Raw HTTP answer from the CRM.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs authenticated GET requests against the CRM.
pub trait CrmTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        bearer: &str,
    ) -> impl Future<Output = Result<TransportResponse, CrmError>> + Send;
}

/// reqwest-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

impl CrmTransport for HttpTransport {
    fn get(
        &self,
        url: &str,
        bearer: &str,
    ) -> impl Future<Output = Result<TransportResponse, CrmError>> + Send {
        let request = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .header(header::ACCEPT, "application/json");

        async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(TransportResponse { status, body })
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse<R> {
    records: Option<Vec<R>>,
}

/// CRM query client.
pub struct CrmClient<T = HttpTransport> {
    transport: T,
    config: CrmConfig,
    timeout: Duration,
}

impl CrmClient<HttpTransport> {
    pub fn new(config: CrmConfig, timeout: Duration) -> Result<Self> {
        Ok(Self::with_transport(HttpTransport::new()?, config, timeout))
    }
}

impl<T: CrmTransport> CrmClient<T> {
    pub fn with_transport(transport: T, config: CrmConfig, timeout: Duration) -> Self {
        Self {
            transport,
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &CrmConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn query_url(&self, soql: &str) -> Result<Url, CrmError> {
        let base = format!(
            "{}/services/data/v{}/query/",
            self.config.instance_url.trim().trim_end_matches('/'),
            self.config.api_version()
        );
        let mut url = Url::parse(&base)
            .map_err(|e| CrmError::Transport(format!("Invalid instance URL {}: {}", base, e)))?;
        url.query_pairs_mut().append_pair("q", soql);
        Ok(url)
    }

    /// Run a SOQL query and decode its `records`.
    ///
    /// Every failure mode is reported as a `CrmError`; a response without a
    /// `records` array is `InvalidResponse`, never an empty list.
    pub async fn query<R: DeserializeOwned>(&self, soql: &str) -> Result<Vec<R>, CrmError> {
        if !self.is_configured() {
            return Err(CrmError::NotConfigured);
        }

        let url = self.query_url(soql)?;
        debug!(url = %url, "CRM query");

        let response = tokio::time::timeout(
            self.timeout,
            self.transport.get(url.as_str(), &self.config.access_token),
        )
        .await
        .map_err(|_| CrmError::Timeout(self.timeout.as_secs()))??;

        if !response.is_success() {
            return Err(CrmError::from_status(response.status, &response.body));
        }

        let parsed: QueryResponse<R> = serde_json::from_str(&response.body)
            .map_err(|e| CrmError::InvalidResponse(format!("Failed to parse query response: {}", e)))?;

        parsed
            .records
            .ok_or_else(|| CrmError::InvalidResponse("Response has no records field".to_string()))
    }
}

//! REST client for the HAProxy Dataplane API.
//!
//! All configuration writes go through versioned transactions; the client
//! itself is a thin request/response wrapper. HTTP 409 is surfaced as
//! [`DataplaneError::VersionConflict`] so callers can drive the retry loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HaproxyConfig;
use crate::error::DataplaneError;

const VERSION_PATH: &str = "/services/haproxy/configuration/version";
const TRANSACTIONS_PATH: &str = "/services/haproxy/transactions";
const BACKENDS_PATH: &str = "/services/haproxy/configuration/backends";
const SERVERS_PATH: &str = "/services/haproxy/configuration/servers";

/// A backend as returned by the configuration API. Only the fields the
/// reconciler inspects are modeled; creation payloads are free-form JSON so
/// per-service backend options pass through verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct Backend {
    pub name: String,
}

/// One server entry in a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

/// The Dataplane operations the reconciler consumes. `txn` scopes every
/// configuration read and write to one transaction.
#[async_trait]
pub trait DataplaneApi: Send + Sync {
    async fn configuration_version(&self) -> Result<u64, DataplaneError>;
    async fn create_transaction(&self, version: u64) -> Result<String, DataplaneError>;
    async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError>;
    /// Idempotent; deleting an already-gone transaction is not an error at
    /// the call sites that matter (they log and move on).
    async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError>;

    async fn get_backend(&self, name: &str, txn: &str) -> Result<Option<Backend>, DataplaneError>;
    async fn create_backend(
        &self,
        payload: &serde_json::Value,
        txn: &str,
    ) -> Result<(), DataplaneError>;

    async fn get_servers(&self, backend: &str, txn: &str) -> Result<Vec<Server>, DataplaneError>;
    async fn create_server(
        &self,
        backend: &str,
        server: &Server,
        txn: &str,
    ) -> Result<(), DataplaneError>;
    async fn replace_server(
        &self,
        backend: &str,
        name: &str,
        server: &Server,
        txn: &str,
    ) -> Result<(), DataplaneError>;
    async fn delete_server(
        &self,
        backend: &str,
        name: &str,
        txn: &str,
    ) -> Result<(), DataplaneError>;
}

/// Production implementation over HTTP with Basic auth.
pub struct HttpDataplaneClient {
    client: reqwest::Client,
    base: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    id: String,
}

impl HttpDataplaneClient {
    pub fn new(config: &HaproxyConfig) -> Result<Self, DataplaneError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base: format!(
                "{}/{}",
                config.base_url.trim_end_matches('/'),
                config.api_version
            ),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<reqwest::Response, DataplaneError> {
        let url = format!("{}{}", self.base, path);
        debug!(method = %method, path = %path, "Dataplane request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(DataplaneError::VersionConflict { body });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DataplaneError::Api {
                status: status.as_u16(),
                method: method.to_string(),
                path: path.to_string(),
                body,
            });
        }

        Ok(response)
    }

    /// Parse a response body that the API wraps as `{"data": ...}` inside a
    /// transaction but returns bare otherwise.
    async fn parse_data<T: DeserializeOwned>(
        response: reqwest::Response,
        path: &str,
    ) -> Result<T, DataplaneError> {
        let value: serde_json::Value = response.json().await?;
        let data = value.get("data").cloned().unwrap_or(value);
        serde_json::from_value(data).map_err(|e| DataplaneError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl DataplaneApi for HttpDataplaneClient {
    async fn configuration_version(&self) -> Result<u64, DataplaneError> {
        let response = self
            .send::<()>(Method::GET, VERSION_PATH, &[], None)
            .await?;
        let text = response.text().await?;
        text.trim().parse().map_err(|_| DataplaneError::Decode {
            path: VERSION_PATH.to_string(),
            reason: format!("expected integer version, got {text:?}"),
        })
    }

    async fn create_transaction(&self, version: u64) -> Result<String, DataplaneError> {
        let version = version.to_string();
        let response = self
            .send::<()>(
                Method::POST,
                TRANSACTIONS_PATH,
                &[("version", version.as_str())],
                None,
            )
            .await?;
        let txn: TransactionResponse = Self::parse_data(response, TRANSACTIONS_PATH).await?;
        Ok(txn.id)
    }

    async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError> {
        let path = format!("{TRANSACTIONS_PATH}/{id}");
        self.send::<()>(Method::PUT, &path, &[], None).await?;
        Ok(())
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError> {
        let path = format!("{TRANSACTIONS_PATH}/{id}");
        self.send::<()>(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn get_backend(&self, name: &str, txn: &str) -> Result<Option<Backend>, DataplaneError> {
        let path = format!("{BACKENDS_PATH}/{name}");
        match self
            .send::<()>(Method::GET, &path, &[("transaction_id", txn)], None)
            .await
        {
            Ok(response) => Ok(Some(Self::parse_data(response, &path).await?)),
            Err(DataplaneError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_backend(
        &self,
        payload: &serde_json::Value,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        self.send(
            Method::POST,
            BACKENDS_PATH,
            &[("transaction_id", txn)],
            Some(payload),
        )
        .await?;
        Ok(())
    }

    async fn get_servers(&self, backend: &str, txn: &str) -> Result<Vec<Server>, DataplaneError> {
        let response = self
            .send::<()>(
                Method::GET,
                SERVERS_PATH,
                &[("transaction_id", txn), ("backend", backend)],
                None,
            )
            .await?;
        Self::parse_data(response, SERVERS_PATH).await
    }

    async fn create_server(
        &self,
        backend: &str,
        server: &Server,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        self.send(
            Method::POST,
            SERVERS_PATH,
            &[("transaction_id", txn), ("backend", backend)],
            Some(server),
        )
        .await?;
        Ok(())
    }

    async fn replace_server(
        &self,
        backend: &str,
        name: &str,
        server: &Server,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        let path = format!("{SERVERS_PATH}/{name}");
        self.send(
            Method::PUT,
            &path,
            &[("transaction_id", txn), ("backend", backend)],
            Some(server),
        )
        .await?;
        Ok(())
    }

    async fn delete_server(
        &self,
        backend: &str,
        name: &str,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        let path = format!("{SERVERS_PATH}/{name}");
        self.send::<()>(
            Method::DELETE,
            &path,
            &[("transaction_id", txn), ("backend", backend)],
            None,
        )
        .await?;
        Ok(())
    }
}

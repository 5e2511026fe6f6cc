// Async HTTP transport for the NatureOS platform API.
//
// Auth: `Authorization: Bearer <api key>` plus `X-Tenant-ID`.
// Writes carry an `Idempotency-Key` header so the platform can drop
// duplicate deliveries of the same command.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::gateway::{
    Ack, AckStatus, Connectivity, EventStream, Fetched, StreamPosition, Transport, TransportError,
};
use crate::transport::TransportConfig;
use crate::websocket;

/// Response header carrying the platform's resource version.
const VERSION_HEADER: &str = "x-resource-version";

#[derive(serde::Deserialize)]
struct ErrorResponse {
    #[serde(default, alias = "detail")]
    message: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// [`Transport`] implementation over HTTPS + WebSocket.
///
/// Tracks reachability as a side effect of every call: connect failures
/// and timeouts flip [`Connectivity`] offline, any response flips it back.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<SecretString>,
    tenant: Option<String>,
    timeout: Duration,
    connectivity: Connectivity,
}

impl HttpTransport {
    // ── Constructors ─────────────────────────────────────────────────

    /// Build from the platform URL, optional API key, and default tenant.
    ///
    /// Injects `Authorization` and `X-Tenant-ID` as default headers.
    pub fn new(
        base_url: &str,
        api_key: Option<&SecretString>,
        tenant: Option<&str>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| Error::Authentication {
                    message: format!("invalid API key header value: {e}"),
                })?;
            value.set_sensitive(true);
            headers.insert("Authorization", value);
        }
        if let Some(tenant) = tenant.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(tenant).map_err(|e| Error::Authentication {
                message: format!("invalid tenant header value: {e}"),
            })?;
            headers.insert("X-Tenant-ID", value);
        }

        let http = transport.build_client(headers)?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            api_key: api_key.cloned(),
            tenant: tenant.map(str::to_owned),
            timeout: transport.timeout,
            connectivity: Connectivity::default(),
        })
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, Error> {
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            api_key: None,
            tenant: None,
            timeout: Duration::from_secs(30),
            connectivity: Connectivity::default(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Shared reachability state (also exposed through [`Transport::connectivity`]).
    pub fn connectivity_state(&self) -> &Connectivity {
        &self.connectivity
    }

    // ── URL builder ──────────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    async fn get_raw(
        &self,
        path: &str,
        params: &[(&str, String)],
        tenant: Option<&str>,
    ) -> Result<(Value, Option<u64>), Error> {
        let url = self.url(path)?;
        debug!("GET {url} params={params:?}");

        let mut request = self.http.get(url).query(params);
        if let Some(tenant) = tenant {
            request = request.header("X-Tenant-ID", tenant);
        }
        let resp = request.send().await?;
        Self::handle_response(path, resp).await
    }

    async fn post_raw(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: &str,
    ) -> Result<(Value, Option<u64>), Error> {
        let url = self.url(path)?;
        debug!("POST {url} idempotency_key={idempotency_key}");

        let resp = self
            .http
            .post(url)
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await?;
        Self::handle_response(path, resp).await
    }

    // ── Response handling ────────────────────────────────────────────

    async fn handle_response(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<(Value, Option<u64>), Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(Self::parse_error(path, status, resp).await);
        }

        let version = resp
            .headers()
            .get(VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok((Value::Null, version));
        }
        let value = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })?;
        Ok((value, version))
    }

    async fn parse_error(
        path: &str,
        status: reqwest::StatusCode,
        resp: reqwest::Response,
    ) -> Error {
        let retry_after_secs = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let raw = resp.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ErrorResponse>(&raw)
            .ok()
            .and_then(|e| e.message);
        let message = parsed.unwrap_or_else(|| if raw.is_empty() { status.to_string() } else { raw });

        match status.as_u16() {
            401 | 403 => Error::Authentication { message },
            404 => Error::NotFound {
                path: path.to_owned(),
            },
            429 => Error::RateLimited { retry_after_secs },
            code => Error::Http {
                status: code,
                message,
            },
        }
    }

    fn observe<T>(&self, result: &Result<T, Error>) {
        match result {
            Ok(_) => {
                self.connectivity.set(true);
            }
            Err(e) if e.is_connectivity_loss() => {
                self.connectivity.set(false);
            }
            // The platform answered; it is reachable even if unhappy.
            Err(_) => {
                self.connectivity.set(true);
            }
        }
    }
}

/// Ensure the base URL ends in `/` so relative joins append.
fn normalize_base_url(raw: &str) -> Result<Url, Error> {
    let mut url = Url::parse(raw)?;
    let path = url.path().trim_end_matches('/').to_owned();
    url.set_path(&format!("{path}/"));
    Ok(url)
}

/// Map the platform's `status` field onto an [`AckStatus`].
fn ack_status(payload: &Value) -> AckStatus {
    match payload.get("status").and_then(Value::as_str) {
        Some("acknowledged" | "completed" | "executed") => AckStatus::Completed,
        Some("rejected" | "failed") => AckStatus::Rejected,
        _ => AckStatus::Received,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        path: &str,
        params: &[(&str, String)],
        tenant: &str,
    ) -> Result<Fetched, TransportError> {
        let result = self.get_raw(path, params, Some(tenant)).await;
        self.observe(&result);
        let (payload, header_version) = result?;
        let version = header_version
            .or_else(|| payload.get("version").and_then(Value::as_u64))
            .unwrap_or(0);
        Ok(Fetched { payload, version })
    }

    async fn send(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: &str,
    ) -> Result<Ack, TransportError> {
        let result = self.post_raw(path, body, idempotency_key).await;
        self.observe(&result);
        let (payload, header_version) = result?;
        Ok(Ack {
            status: ack_status(&payload),
            version: header_version.or_else(|| payload.get("version").and_then(Value::as_u64)),
            payload,
        })
    }

    async fn open_stream(
        &self,
        path: &str,
        from: Option<StreamPosition>,
    ) -> Result<EventStream, TransportError> {
        let mut url = self.url(path)?;
        if let Some(pos) = from {
            url.query_pairs_mut()
                .append_pair("after_ts", &pos.timestamp.to_rfc3339())
                .append_pair("after_seq", &pos.sequence.to_string());
        }
        let url = websocket::websocket_url(&url)?;

        let mut headers = Vec::new();
        if let Some(ref key) = self.api_key {
            headers.push(("Authorization", format!("Bearer {}", key.expose_secret())));
        }
        if let Some(ref tenant) = self.tenant {
            headers.push(("X-Tenant-ID", tenant.clone()));
        }

        let result = websocket::connect(&url, headers, self.timeout).await;
        self.observe(&result);
        Ok(result?)
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    /// `GET /health`; updates connectivity either way.
    async fn probe(&self) -> Result<(), TransportError> {
        let result = self.get_raw("health", &[], None).await.map(|_| ());
        self.observe(&result);
        Ok(result?)
    }
}

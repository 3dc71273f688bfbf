//! REST access to the simulator's web API.
//!
//! Two jobs: pick the API generation the simulator speaks, and bulk-load the
//! dataref/command catalogs into a [`Catalog`].
//!
//! # Capability negotiation
//!
//! Newer simulators describe themselves at `GET /api/capabilities`:
//!
//! ```json
//! {"api": {"versions": ["v1", "v2"]}}
//! ```
//!
//! The newest supported generation wins (`v2` preferred). Older simulators
//! have no capabilities endpoint at all; for those a probe of
//! `/api/v1/datarefs/count` decides whether `v1` is available. The command
//! catalog only exists from `v2` on, so a `v1` session has working dataref
//! sync but no command operations.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use xplink_core::protocol::catalog::{Catalog, CatalogError};

/// Per-request timeout for catalog and capability fetches.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for REST operations against the simulator.
#[derive(Debug, Error)]
pub enum RestError {
    /// The HTTP client itself could not be constructed.
    #[error("failed to construct HTTP client: {0}")]
    Init(#[source] reqwest::Error),

    /// The request could not be sent or the connection failed.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The simulator answered with a non-success status.
    #[error("simulator returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// The response body could not be read or parsed.
    #[error("unreadable response from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The catalog payload was structurally invalid.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Neither the capabilities endpoint nor the v1 probe answered usefully.
    #[error("simulator at {base} speaks no supported API generation")]
    NoSupportedApi { base: String },
}

/// The API generations this client can speak, newest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    /// The path segment used in URLs, e.g. `"v2"` in `/api/v2/datarefs`.
    pub fn path_segment(self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Shape of the `/api/capabilities` reply. Unknown fields (simulator
/// version blocks etc.) are ignored.
#[derive(Debug, Deserialize)]
struct CapabilitiesReply {
    api: ApiBlock,
}

#[derive(Debug, Deserialize)]
struct ApiBlock {
    versions: Vec<String>,
}

/// Picks the newest generation the client supports out of an advertised
/// list; `None` when nothing usable is advertised.
fn choose_version(versions: &[String]) -> Option<ApiVersion> {
    if versions.iter().any(|v| v == "v2") {
        Some(ApiVersion::V2)
    } else if versions.iter().any(|v| v == "v1") {
        Some(ApiVersion::V1)
    } else {
        None
    }
}

/// A negotiated HTTP session with one simulator.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    host: String,
    port: u16,
    version: ApiVersion,
}

impl RestClient {
    /// Connects to `host:port`, negotiates the API generation, and returns a
    /// ready client.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::NoSupportedApi`] when neither negotiation path
    /// succeeds, or the transport errors of the probes.
    pub async fn negotiate(host: &str, port: u16) -> Result<RestClient, RestError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RestError::Init)?;

        let base = format!("http://{host}:{port}");
        let capabilities_url = format!("{base}/api/capabilities");

        let version = match fetch_capabilities(&http, &capabilities_url).await {
            Ok(versions) => {
                choose_version(&versions).ok_or_else(|| RestError::NoSupportedApi {
                    base: base.clone(),
                })?
            }
            Err(err) => {
                // Pre-capabilities simulators 404 here; probe v1 directly.
                debug!("capabilities endpoint unavailable ({err}); probing v1");
                let probe_url = format!("{base}/api/v1/datarefs/count");
                probe(&http, &probe_url).await?;
                ApiVersion::V1
            }
        };

        info!("negotiated simulator API {version} at {base}");
        Ok(RestClient {
            http,
            host: host.to_string(),
            port,
            version,
        })
    }

    /// The negotiated API generation.
    pub fn version(&self) -> ApiVersion {
        self.version
    }

    /// URL of the streaming WebSocket endpoint for this session.
    pub fn ws_url(&self) -> String {
        format!(
            "ws://{}:{}/api/{}",
            self.host,
            self.port,
            self.version.path_segment()
        )
    }

    fn api_url(&self, resource: &str) -> String {
        format!(
            "http://{}:{}/api/{}/{resource}",
            self.host,
            self.port,
            self.version.path_segment()
        )
    }

    /// Bulk-loads the dataref catalog, and on `v2` the command catalog, into
    /// a fresh [`Catalog`].
    ///
    /// # Errors
    ///
    /// Transport errors for either fetch, or [`RestError::Catalog`] when a
    /// payload is structurally invalid.
    pub async fn load_catalog(&self) -> Result<Catalog, RestError> {
        let mut catalog = Catalog::new();

        let body = self.get_text(&self.api_url("datarefs")).await?;
        let dataref_count = catalog.load_datarefs(&body)?;
        info!("loaded {dataref_count} datarefs from the simulator catalog");

        if self.version == ApiVersion::V2 {
            let body = self.get_text(&self.api_url("commands")).await?;
            let command_count = catalog.load_commands(&body)?;
            info!("loaded {command_count} commands from the simulator catalog");
        } else {
            warn!("v1 API has no command catalog; command operations are unavailable");
        }

        Ok(catalog)
    }

    async fn get_text(&self, url: &str) -> Result<String, RestError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| RestError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(RestError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|source| RestError::Body {
            url: url.to_string(),
            source,
        })
    }
}

/// Fetches and parses the capabilities document.
async fn fetch_capabilities(
    http: &reqwest::Client,
    url: &str,
) -> Result<Vec<String>, RestError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|source| RestError::Http {
            url: url.to_string(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(RestError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let reply: CapabilitiesReply =
        response.json().await.map_err(|source| RestError::Body {
            url: url.to_string(),
            source,
        })?;
    Ok(reply.api.versions)
}

/// Issues a GET and only cares whether it succeeds.
async fn probe(http: &reqwest::Client, url: &str) -> Result<(), RestError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|source| RestError::Http {
            url: url.to_string(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(RestError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client(version: ApiVersion) -> RestClient {
        RestClient {
            http: reqwest::Client::new(),
            host: "192.168.1.40".to_string(),
            port: 8086,
            version,
        }
    }

    #[test]
    fn test_choose_version_prefers_v2() {
        let versions = vec!["v1".to_string(), "v2".to_string()];
        assert_eq!(choose_version(&versions), Some(ApiVersion::V2));
    }

    #[test]
    fn test_choose_version_accepts_v1_only() {
        let versions = vec!["v1".to_string()];
        assert_eq!(choose_version(&versions), Some(ApiVersion::V1));
    }

    #[test]
    fn test_choose_version_ignores_unknown_generations() {
        // A future simulator may advertise generations we do not speak yet.
        let versions = vec!["v3".to_string(), "v2".to_string()];
        assert_eq!(choose_version(&versions), Some(ApiVersion::V2));
    }

    #[test]
    fn test_choose_version_rejects_empty_list() {
        assert_eq!(choose_version(&[]), None);
    }

    #[test]
    fn test_capabilities_reply_parses_with_extra_fields() {
        let body = r#"{
            "api": {"versions": ["v1", "v2"]},
            "x-plane": {"version": "12.1.4"}
        }"#;

        let reply: CapabilitiesReply = serde_json::from_str(body).expect("parse");
        assert_eq!(reply.api.versions, vec!["v1", "v2"]);
    }

    #[test]
    fn test_ws_url_uses_negotiated_segment() {
        assert_eq!(
            client(ApiVersion::V2).ws_url(),
            "ws://192.168.1.40:8086/api/v2"
        );
        assert_eq!(
            client(ApiVersion::V1).ws_url(),
            "ws://192.168.1.40:8086/api/v1"
        );
    }

    #[test]
    fn test_api_url_formation() {
        assert_eq!(
            client(ApiVersion::V2).api_url("datarefs"),
            "http://192.168.1.40:8086/api/v2/datarefs"
        );
    }

    #[test]
    fn test_api_version_display() {
        assert_eq!(ApiVersion::V2.to_string(), "v2");
        assert_eq!(ApiVersion::V1.to_string(), "v1");
    }
}

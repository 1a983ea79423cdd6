// # mihomo Backend
//
// `CoreBackend` implementation over the mihomo (clash-family) external
// controller REST API.
//
// ## Features
//
// - Proxy, provider, rule and configuration reads
// - Per-node delay tests
// - Optional bearer secret, never exposed in logs or `Debug` output
// - Host state (system proxy, uptime) read from the local process
//
// ## Usage
//
// ```rust,ignore
// use proxysync_mihomo::MihomoBackend;
// use proxysync_core::CoreBackend;
//
// let backend = MihomoBackend::new(
//     "http://127.0.0.1:9097",
//     Some("secret".to_string()),
//     "https://www.gstatic.com/generate_204",
// )?;
//
// let snapshot = backend.get_proxies().await?;
// ```
//
// ## Error Mapping
//
// | Condition                         | Error                |
// |-----------------------------------|----------------------|
// | Connection refused / reset        | `Transport`          |
// | Client timeout, HTTP 408 or 504   | `Timeout`            |
// | Any other non-2xx status          | `Transport`          |
// | Body does not decode              | `MalformedResponse`  |

use async_trait::async_trait;
use proxysync_core::error::{Error, Result};
use proxysync_core::model::{
    CoreConfig, ProviderSnapshot, ProxySnapshot, RuleProviderSnapshot, RulesSnapshot,
    SystemProxyState,
};
use proxysync_core::CoreBackend;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Default external-controller address
pub const DEFAULT_CONTROLLER_URL: &str = "http://127.0.0.1:9097";

/// Timeout for ordinary controller requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra client-side budget on top of the delay-test timeout
///
/// The core enforces the test timeout itself and answers 504; the client
/// deadline only catches a controller that stops answering altogether.
const DELAY_GRACE: Duration = Duration::from_secs(2);

/// Running mode reported when the controller answers
pub const MODE_SIDECAR: &str = "Sidecar";

/// Running mode reported when the controller cannot be reached
pub const MODE_NOT_RUNNING: &str = "NotRunning";

/// Environment variables consulted for the system proxy server, in order
const PROXY_ENV_VARS: [&str; 6] = [
    "https_proxy",
    "HTTPS_PROXY",
    "http_proxy",
    "HTTP_PROXY",
    "all_proxy",
    "ALL_PROXY",
];

const NO_PROXY_ENV_VARS: [&str; 2] = ["no_proxy", "NO_PROXY"];

/// mihomo external-controller backend
///
/// # Security
///
/// The secret is sent as a bearer token and is never logged. The `Debug`
/// implementation redacts it.
pub struct MihomoBackend {
    /// Controller base URL
    base_url: Url,

    /// Optional controller secret
    secret: Option<String>,

    /// URL the core fetches during delay tests
    test_url: String,

    /// HTTP client with the default request timeout
    client: reqwest::Client,

    /// Construction time, used as the host uptime origin
    started_at: Instant,
}

impl std::fmt::Debug for MihomoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MihomoBackend")
            .field("base_url", &self.base_url.as_str())
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .field("test_url", &self.test_url)
            .finish()
    }
}

/// Body of a successful delay test
#[derive(Debug, Deserialize)]
struct DelayResponse {
    delay: u64,
}

/// Body of a failed controller call
#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: String,
}

impl MihomoBackend {
    /// Create a new backend
    ///
    /// # Parameters
    ///
    /// - `controller_url`: Base URL of the external controller
    /// - `secret`: Controller secret; `None` or empty disables auth
    /// - `test_url`: URL used for delay tests
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the URL is not an absolute http(s)
    /// URL or the HTTP client cannot be built.
    pub fn new(
        controller_url: &str,
        secret: Option<String>,
        test_url: impl Into<String>,
    ) -> Result<Self> {
        let base_url = Url::parse(controller_url)
            .map_err(|e| Error::config(format!("invalid controller URL '{}': {}", controller_url, e)))?;

        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(Error::config(format!(
                "controller URL must be http(s): {}",
                controller_url
            )));
        }

        let test_url = test_url.into();
        if test_url.trim().is_empty() {
            return Err(Error::config("delay test URL cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            secret: secret.filter(|s| !s.is_empty()),
            test_url,
            client,
            started_at: Instant::now(),
        })
    }

    /// Controller base URL
    pub fn controller_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Build an endpoint URL from path segments
    ///
    /// Segments are percent-encoded, so node names containing `/`, spaces
    /// or non-ASCII characters address a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config("controller URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn delay_endpoint(&self, proxy_name: &str, timeout_ms: u64) -> Result<Url> {
        let mut url = self.endpoint(&["proxies", proxy_name, "delay"])?;
        url.query_pairs_mut()
            .append_pair("timeout", &timeout_ms.to_string())
            .append_pair("url", &self.test_url);
        Ok(url)
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        }
    }

    /// GET an endpoint and decode its JSON body
    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.endpoint(segments)?;
        tracing::debug!("GET {}", url.path());

        let response = self.get(url).send().await.map_err(map_send_error)?;
        decode(response).await
    }
}

/// Map a failed send onto the crate error kinds
fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(format!("mihomo request timed out: {}", e))
    } else {
        Error::transport(format!("mihomo request failed: {}", e))
    }
}

/// Map a non-success status onto the crate error kinds
fn map_status(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<MessageResponse>(body)
        .map(|m| m.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string());

    match status.as_u16() {
        401 | 403 => Error::transport(format!(
            "mihomo rejected the controller secret. Status: {}",
            status
        )),
        404 => Error::transport(format!("mihomo endpoint not found: {}", message)),
        408 | 504 => Error::timeout(format!("mihomo timed out: {}", message)),
        500..=599 => Error::transport(format!("mihomo server error: {} - {}", status, message)),
        _ => Error::transport(format!("mihomo request failed: {} - {}", status, message)),
    }
}

/// Check the status and decode a JSON body
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await.map_err(map_send_error)?;

    if !status.is_success() {
        return Err(map_status(status, &String::from_utf8_lossy(&body)));
    }

    serde_json::from_slice(&body)
        .map_err(|e| Error::malformed(format!("failed to decode mihomo response: {}", e)))
}

/// Build the system proxy state from proxy environment variables
///
/// `lookup` returns the value of one variable. The first non-empty proxy
/// variable wins; its scheme and trailing slash are stripped so `server`
/// is a bare `host:port`.
fn system_proxy_from(lookup: impl Fn(&str) -> Option<String>) -> SystemProxyState {
    let first = |names: &[&str]| {
        names
            .iter()
            .filter_map(|name| lookup(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    };

    let server = first(&PROXY_ENV_VARS).map(|raw| {
        let without_scheme = raw.split_once("://").map_or(raw.as_str(), |(_, rest)| rest);
        without_scheme.trim_end_matches('/').to_string()
    });

    SystemProxyState {
        enable: server.is_some(),
        server: server.unwrap_or_default(),
        bypass: first(&NO_PROXY_ENV_VARS).unwrap_or_default(),
    }
}

#[async_trait]
impl CoreBackend for MihomoBackend {
    /// ```http
    /// GET /proxies
    /// ```
    async fn get_proxies(&self) -> Result<ProxySnapshot> {
        self.get_json(&["proxies"]).await
    }

    /// ```http
    /// GET /providers/proxies
    /// ```
    async fn get_proxy_providers(&self) -> Result<ProviderSnapshot> {
        self.get_json(&["providers", "proxies"]).await
    }

    async fn get_rule_providers(&self) -> Result<RuleProviderSnapshot> {
        self.get_json(&["providers", "rules"]).await
    }

    async fn get_rules(&self) -> Result<RulesSnapshot> {
        self.get_json(&["rules"]).await
    }

    /// ```http
    /// GET /configs
    /// ```
    async fn get_core_config(&self) -> Result<CoreConfig> {
        self.get_json(&["configs"]).await
    }

    async fn get_system_proxy(&self) -> Result<SystemProxyState> {
        Ok(system_proxy_from(|name| std::env::var(name).ok()))
    }

    /// Any HTTP answer from `/version` means the core is up
    async fn get_running_mode(&self) -> Result<String> {
        let url = self.endpoint(&["version"])?;

        match self.get(url).send().await {
            Ok(response) => {
                tracing::debug!("mihomo /version answered {}", response.status());
                Ok(MODE_SIDECAR.to_string())
            }
            Err(e) if e.is_connect() => {
                tracing::debug!("mihomo unreachable: {}", e);
                Ok(MODE_NOT_RUNNING.to_string())
            }
            Err(e) => Err(map_send_error(e)),
        }
    }

    async fn get_uptime_ms(&self) -> Result<u64> {
        Ok(u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    /// ```http
    /// GET /proxies/:name/delay?timeout=5000&url=https://...
    /// ```
    ///
    /// The core answers `{"delay": ms}` on success, 504 when the test times
    /// out and 503 when the node fails.
    async fn probe_delay(&self, proxy_name: &str, timeout_ms: u64) -> Result<u64> {
        let url = self.delay_endpoint(proxy_name, timeout_ms)?;
        tracing::debug!("Delay test for {} ({} ms)", proxy_name, timeout_ms);

        let response = self
            .get(url)
            .timeout(Duration::from_millis(timeout_ms) + DELAY_GRACE)
            .send()
            .await
            .map_err(map_send_error)?;

        let body: DelayResponse = decode(response).await?;
        Ok(body.delay)
    }

    fn backend_name(&self) -> &'static str {
        "mihomo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn backend(url: &str) -> MihomoBackend {
        MihomoBackend::new(url, Some("s3cr3t".to_string()), "http://cp.example/generate_204")
            .unwrap()
    }

    #[test]
    fn test_secret_not_exposed_in_debug() {
        let backend = backend("http://127.0.0.1:9097");
        let debug_output = format!("{:?}", backend);

        assert!(!debug_output.contains("s3cr3t"));
        assert!(debug_output.contains("<REDACTED>"));
        assert!(debug_output.contains("127.0.0.1:9097"));
    }

    #[test]
    fn test_empty_secret_disables_auth() {
        let backend = MihomoBackend::new(DEFAULT_CONTROLLER_URL, Some(String::new()), "http://t")
            .unwrap();
        assert!(backend.secret.is_none());
    }

    #[test]
    fn test_invalid_controller_url_rejected() {
        for url in ["not a url", "ftp://127.0.0.1:9097", "mailto:core@example.com"] {
            let result = MihomoBackend::new(url, None, "http://t");
            assert!(matches!(result, Err(Error::Config(_))), "accepted {}", url);
        }

        let result = MihomoBackend::new(DEFAULT_CONTROLLER_URL, None, "  ");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_endpoint_encodes_node_names() {
        let backend = backend("http://127.0.0.1:9097");

        let url = backend.endpoint(&["proxies", "HK 01/Premium", "delay"]).unwrap();
        assert_eq!(url.path(), "/proxies/HK%2001%2FPremium/delay");

        let url = backend.endpoint(&["providers", "proxies"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9097/providers/proxies");
    }

    #[test]
    fn test_endpoint_keeps_base_path_prefix() {
        let backend = backend("http://router.lan/clash/");
        let url = backend.endpoint(&["configs"]).unwrap();
        assert_eq!(url.as_str(), "http://router.lan/clash/configs");
    }

    #[test]
    fn test_delay_endpoint_query() {
        let backend = backend("http://127.0.0.1:9097");
        let url = backend.delay_endpoint("hk-1", 5000).unwrap();

        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("timeout").map(String::as_str), Some("5000"));
        assert_eq!(
            query.get("url").map(String::as_str),
            Some("http://cp.example/generate_204")
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::GATEWAY_TIMEOUT, r#"{"message":"Timeout"}"#),
            Error::Timeout(_)
        ));
        assert!(matches!(
            map_status(StatusCode::REQUEST_TIMEOUT, ""),
            Error::Timeout(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, r#"{"message":"Unauthorized"}"#),
            Error::Transport(_)
        ));

        let err = map_status(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"message":"An error occurred in the delay test"}"#,
        );
        match err {
            Error::Transport(msg) => assert!(msg.contains("delay test")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unauthorized_message_omits_secret() {
        let err = map_status(StatusCode::UNAUTHORIZED, "Bearer s3cr3t");
        assert!(!err.to_string().contains("s3cr3t"));
    }

    #[test]
    fn test_delay_body_decodes() {
        let body: DelayResponse = serde_json::from_str(r#"{"delay": 231}"#).unwrap();
        assert_eq!(body.delay, 231);
    }

    #[test]
    fn test_system_proxy_from_env() {
        let env: HashMap<&str, &str> = [
            ("HTTPS_PROXY", ""),
            ("http_proxy", "http://127.0.0.1:7897/"),
            ("all_proxy", "socks5://127.0.0.1:7891"),
            ("no_proxy", "localhost,127.0.0.1"),
        ]
        .into_iter()
        .collect();

        let state = system_proxy_from(|name| env.get(name).map(|v| v.to_string()));

        assert!(state.enable);
        assert_eq!(state.server, "127.0.0.1:7897");
        assert_eq!(state.bypass, "localhost,127.0.0.1");
    }

    #[test]
    fn test_system_proxy_unset() {
        let state = system_proxy_from(|_| None);
        assert_eq!(state, SystemProxyState::default());
    }

    #[tokio::test]
    async fn test_unreachable_controller() {
        // Nothing listens on the discard port
        let backend = backend("http://127.0.0.1:9");

        assert_eq!(backend.get_running_mode().await.unwrap(), MODE_NOT_RUNNING);
        assert!(matches!(backend.get_proxies().await, Err(Error::Transport(_))));

        // Host state does not depend on the controller
        assert!(backend.get_system_proxy().await.is_ok());
        assert!(backend.get_uptime_ms().await.is_ok());
    }

    #[test]
    fn test_backend_name() {
        assert_eq!(backend(DEFAULT_CONTROLLER_URL).backend_name(), "mihomo");
    }
}

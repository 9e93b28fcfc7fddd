//! REST client.

use crate::config::{ConfigParams, ConnectionOptions};
use crate::connect::{BackendKind, ConnectionComposer};
use crate::storage::PagingParams;
use crate::{Context, Error, ErrorCode, Result};
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Default request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Query parameters of one call, in insertion order.
pub type QueryParams = Vec<(String, String)>;

/// Adds `trace_id` from `ctx`, if it has one.
pub fn add_trace_id(params: &mut QueryParams, ctx: &Context) {
    if let Some(trace_id) = ctx.trace_id() {
        params.push(("trace_id".to_string(), trace_id.to_string()));
    }
}

/// Adds every filter entry as a query parameter.
pub fn add_filter_params(params: &mut QueryParams, filter: &ConfigParams) {
    for (key, value) in filter.iter() {
        params.push((key.to_string(), value.to_string()));
    }
}

/// Adds `skip`, `take` and `total` when set.
pub fn add_paging_params(params: &mut QueryParams, paging: &PagingParams) {
    if let Some(skip) = paging.skip {
        params.push(("skip".to_string(), skip.to_string()));
    }
    if let Some(take) = paging.take {
        params.push(("take".to_string(), take.to_string()));
    }
    if paging.total {
        params.push(("total".to_string(), "true".to_string()));
    }
}

/// Joins a base route and a call route with single slashes.
#[must_use]
pub fn join_route(base_route: Option<&str>, route: &str) -> String {
    let mut path = String::new();
    for part in [base_route.unwrap_or(""), route] {
        let part = part.trim_matches('/');
        if !part.is_empty() {
            path.push('/');
            path.push_str(part);
        }
    }
    path
}

/// HTTP client for a remote service.
///
/// The endpoint is composed from `connection.*` the same way as a database
/// connection (`connection.protocol` selects `http` or `https`).
/// `base_route` prefixes every call, `options.connect_timeout` and
/// `options.timeout` bound each request.
#[derive(Debug)]
pub struct RestClient {
    composer: ConnectionComposer,
    config: ConfigParams,
    base_route: Option<String>,
    connect_timeout: Duration,
    timeout: Duration,
    open: Option<(reqwest::Client, String)>,
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RestClient {
    /// Creates a closed client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            composer: ConnectionComposer::for_backend(BackendKind::Http),
            config: ConfigParams::new(),
            base_route: None,
            connect_timeout: ConnectionOptions::default().connect_timeout,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            open: None,
        }
    }

    /// Reads connection, `base_route` and timeouts.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.config = config.clone();
        self.base_route = config.get_as_string("base_route");
        self.connect_timeout = ConnectionOptions::default().configure(config).connect_timeout;
        self.timeout =
            Duration::from_millis(config.get_as_u64_or("options.timeout", DEFAULT_TIMEOUT_MS));
    }

    /// Returns true if the client is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Returns the base URL, or `None` when closed.
    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.open.as_ref().map(|(_, url)| url.as_str())
    }

    /// Composes the endpoint and builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint does not validate, or
    /// `CONNECT_FAILED` if the HTTP client cannot be built.
    pub fn open(&mut self, ctx: &Context) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let composed = self.composer.resolve(&self.config)?;
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .build()
            .map_err(|e| {
                Error::connection(
                    ErrorCode::ConnectFailed,
                    "Failed to build HTTP client",
                    Some(Box::new(e)),
                )
            })?;
        let base_url = composed.uri().trim_end_matches('/').to_string();

        tracing::debug!(
            backend = "http",
            url = %base_url,
            trace_id = ctx.trace_id_or_empty(),
            "Opened REST client"
        );
        self.open = Some((client, base_url));
        Ok(())
    }

    /// Drops the HTTP client.
    pub fn close(&mut self, ctx: &Context) {
        if self.open.take().is_some() {
            tracing::debug!(
                backend = "http",
                trace_id = ctx.trace_id_or_empty(),
                "Closed REST client"
            );
        }
    }

    /// Returns the full path of `route` under the base route.
    #[must_use]
    pub fn request_route(&self, route: &str) -> String {
        join_route(self.base_route.as_deref(), route)
    }

    /// Calls the remote service and decodes the JSON response.
    ///
    /// `trace_id` from `ctx` is added to `params`. An empty or `204`
    /// response is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the client is not open, or
    /// [`Error::OperationFailed`] if the request fails, the service answers
    /// with an error status, or the body does not decode as `R`.
    pub async fn call<B, R>(
        &self,
        method: Method,
        route: &str,
        ctx: &Context,
        mut params: QueryParams,
        body: Option<&B>,
    ) -> Result<Option<R>>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let Some((client, base_url)) = self.open.as_ref() else {
            return Err(Error::invalid_state(
                ErrorCode::NoConnection,
                "REST client is not opened",
            ));
        };
        add_trace_id(&mut params, ctx);
        let url = format!("{base_url}{}", self.request_route(route));

        let mut request = client.request(method.clone(), &url).query(&params);
        if let Some(body) = body {
            request = request.json(body);
        }
        let failed = |cause: String| Error::OperationFailed {
            operation: format!("{method} {route}"),
            cause,
        };

        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| failed(e.to_string()))?;

        tracing::trace!(
            backend = "http",
            method = %method,
            url = %url,
            status = status.as_u16(),
            trace_id = ctx.trace_id_or_empty(),
            "REST call"
        );
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}: {text}")));
        }
        if status == reqwest::StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| failed(format!("Invalid JSON response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_join_route() {
        assert_eq!(join_route(Some("/api/v1/"), "/dummies"), "/api/v1/dummies");
        assert_eq!(join_route(None, "dummies"), "/dummies");
        assert_eq!(join_route(Some("api"), ""), "/api");
        assert_eq!(join_route(None, ""), "");
    }

    #[test]
    fn test_query_helpers() {
        let mut params = QueryParams::new();
        add_trace_id(&mut params, &Context::new("123"));
        add_filter_params(&mut params, &ConfigParams::from_tuples(&[("key", "Key 1")]));
        add_paging_params(&mut params, &PagingParams::new(Some(0), Some(10), true));
        let keys: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["trace_id", "key", "skip", "take", "total"]);

        let mut empty = QueryParams::new();
        add_trace_id(&mut empty, &Context::default());
        add_paging_params(&mut empty, &PagingParams::default());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_open_requires_host() {
        let mut client = RestClient::new();
        let err = client.open(&Context::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoConnection);
    }

    #[tokio::test]
    async fn test_call_before_open() {
        let client = RestClient::new();
        let err = client
            .call::<Value, Value>(Method::GET, "x", &Context::default(), QueryParams::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    /// Serves one canned response and returns the request line.
    async fn serve_once(status: &'static str, body: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (port, task)
    }

    fn client_for(port: u16) -> RestClient {
        let port = port.to_string();
        let mut client = RestClient::new();
        client.configure(&ConfigParams::from_tuples(&[
            ("connection.protocol", "http"),
            ("connection.host", "127.0.0.1"),
            ("connection.port", port.as_str()),
            ("base_route", "api/v1"),
        ]));
        client.open(&Context::default()).unwrap();
        client
    }

    #[tokio::test]
    async fn test_call_decodes_json_and_sends_trace_id() {
        let (port, server) = serve_once("200 OK", r#"{"id":"1","key":"Key 1"}"#).await;
        let client = client_for(port);

        let result: Option<Value> = client
            .call::<Value, _>(Method::GET, "dummies/1", &Context::new("t1"), QueryParams::new(), None)
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"id": "1", "key": "Key 1"})));
        assert_eq!(server.await.unwrap(), "GET /api/v1/dummies/1?trace_id=t1 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_error_status() {
        let (port, _server) = serve_once("404 Not Found", r#"{"code":"NOT_FOUND"}"#).await;
        let client = client_for(port);

        let err = client
            .call::<Value, Value>(
                Method::POST,
                "dummies",
                &Context::default(),
                QueryParams::new(),
                Some(&json!({"key": "k"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}

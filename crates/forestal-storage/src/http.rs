//! Outbound JSON fetches with timeouts, retry classification and capped backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts are final so the configured timeout bounds the whole fetch.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not reach {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("credentials rejected ({status}) by {url}: api key or session cookie may be invalid or expired")]
    Credentials { status: u16, url: String },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("malformed response body from {url}: {reason}; starts with {snippet:?}")]
    Malformed {
        url: String,
        reason: String,
        snippet: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    /// Short category label for logs and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "unreachable",
            Self::Timeout { .. } => "timeout",
            Self::Credentials { .. } => "credentials",
            Self::HttpStatus { .. } => "http_status",
            Self::Malformed { .. } => "malformed",
            Self::Request(_) => "request",
        }
    }
}

/// Truncate on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct JsonRequest<'a> {
    pub url: &'a str,
    pub query: Vec<(&'a str, String)>,
    pub headers: HeaderMap,
    /// Overrides the client-wide timeout for this request.
    pub timeout: Option<Duration>,
}

impl<'a> JsonRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            url,
            query: Vec::new(),
            headers: HeaderMap::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub final_url: String,
    pub body: JsonValue,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

const BODY_SNIPPET_CHARS: usize = 500;

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    fn map_request_error(&self, url: &str, timeout: Duration, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout,
            }
        } else if err.is_connect() {
            FetchError::Unreachable {
                url: url.to_string(),
                source: err,
            }
        } else {
            FetchError::Request(err)
        }
    }

    pub async fn get_json(&self, request: &JsonRequest<'_>) -> Result<FetchedJson, FetchError> {
        let span = info_span!("http_fetch", url = request.url);
        self.get_json_inner(request).instrument(span).await
    }

    async fn get_json_inner(&self, request: &JsonRequest<'_>) -> Result<FetchedJson, FetchError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let mut attempt = 0usize;

        loop {
            let sent = self
                .client
                .get(request.url)
                .query(&request.query)
                .headers(request.headers.clone())
                .timeout(timeout)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, error = %err, "transient request failure, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(self.map_request_error(request.url, timeout, err));
                }
            };

            let status = resp.status();
            let final_url = resp.url().to_string();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(FetchError::Credentials {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            if !status.is_success() {
                if classify_status(status) == RetryDisposition::Retryable
                    && attempt < self.backoff.max_retries
                {
                    warn!(attempt, status = status.as_u16(), "retryable upstream status");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: truncate_chars(&body, BODY_SNIPPET_CHARS),
                });
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|err| self.map_request_error(&final_url, timeout, err))?;
            return match serde_json::from_slice::<JsonValue>(&bytes) {
                Ok(body) => Ok(FetchedJson {
                    status,
                    final_url,
                    body,
                }),
                Err(err) => Err(FetchError::Malformed {
                    url: final_url,
                    reason: err.to_string(),
                    snippet: truncate_chars(&String::from_utf8_lossy(&bytes), 200),
                }),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("forestal-test".into()),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .expect("client")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("órdenes", 3), "órd…");
        assert_eq!(truncate_chars("ok", 10), "ok");
    }

    #[tokio::test]
    async fn sends_query_and_headers_and_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/listar"))
            .and(query_param("from", "2024-01-01"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"_id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/listar", server.uri());
        let mut request = JsonRequest::get(&url);
        request.query.push(("from", "2024-01-01".into()));
        request
            .headers
            .insert("x-api-key", HeaderValue::from_static("secret"));

        let fetched = fetcher(0).get_json(&request).await.expect("fetch");
        assert_eq!(fetched.status, StatusCode::OK);
        assert_eq!(fetched.body, json!([{"_id": 1}]));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_credentials_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let url = server.uri();
        let err = fetcher(3).get_json(&JsonRequest::get(&url)).await.unwrap_err();
        assert!(matches!(err, FetchError::Credentials { status: 403, .. }));
        assert_eq!(err.kind(), "credentials");
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surfaced_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(3)
            .mount(&server)
            .await;

        let url = server.uri();
        let err = fetcher(2).get_json(&JsonRequest::get(&url)).await.unwrap_err();
        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let url = server.uri();
        let err = fetcher(0).get_json(&JsonRequest::get(&url)).await.unwrap_err();
        match err {
            FetchError::Malformed { snippet, .. } => assert!(snippet.starts_with("<html>")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let url = server.uri();
        let mut request = JsonRequest::get(&url);
        request.timeout = Some(Duration::from_millis(50));
        let err = fetcher(0).get_json(&request).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn timeouts_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(1)
            .mount(&server)
            .await;

        let url = server.uri();
        let mut request = JsonRequest::get(&url);
        request.timeout = Some(Duration::from_millis(50));
        let err = fetcher(3).get_json(&request).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let err = fetcher(0)
            .get_json(&JsonRequest::get("http://127.0.0.1:9/"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unreachable { .. }), "got {err:?}");
    }
}

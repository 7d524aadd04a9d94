use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use forestal_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, JsonRequest};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::UpstreamSource;

#[derive(Debug, Clone)]
pub struct GisConfig {
    pub work_orders_url: String,
    pub admin_url: String,
    pub api_key: String,
    pub session_id: String,
    pub work_orders_timeout: Duration,
    pub admin_timeout: Duration,
    pub max_retries: usize,
}

/// Client for the upstream GIS work-order and administrative endpoints.
#[derive(Debug, Clone)]
pub struct GisClient {
    http: HttpFetcher,
    config: GisConfig,
    work_order_headers: HeaderMap,
    admin_headers: HeaderMap,
}

impl GisClient {
    pub fn new(config: GisConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.work_orders_timeout.max(config.admin_timeout),
            user_agent: Some(format!("forestal-etl/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy {
                max_retries: config.max_retries,
                ..BackoffPolicy::default()
            },
        })?;

        let mut admin_headers = HeaderMap::new();
        admin_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        admin_headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("PHPSESSID={}", config.session_id))
                .context("session id is not a valid header value")?,
        );

        let mut work_order_headers = admin_headers.clone();
        let mut api_key =
            HeaderValue::from_str(&config.api_key).context("api key is not a valid header value")?;
        api_key.set_sensitive(true);
        work_order_headers.insert("x-api-key", api_key);

        Ok(Self {
            http,
            config,
            work_order_headers,
            admin_headers,
        })
    }

    pub fn config(&self) -> &GisConfig {
        &self.config
    }
}

#[async_trait]
impl UpstreamSource for GisClient {
    async fn fetch_work_orders(&self, since: &str) -> Result<JsonValue, FetchError> {
        info!(url = %self.config.work_orders_url, from = since, "fetching work orders");
        let request = JsonRequest {
            url: &self.config.work_orders_url,
            query: vec![("from", since.to_string())],
            headers: self.work_order_headers.clone(),
            timeout: Some(self.config.work_orders_timeout),
        };
        let fetched = self.http.get_json(&request).await?;
        debug!(status = fetched.status.as_u16(), final_url = %fetched.final_url, "work orders received");
        Ok(fetched.body)
    }

    async fn fetch_admin_data(&self) -> Result<JsonValue, FetchError> {
        info!(url = %self.config.admin_url, "fetching administrative data");
        let request = JsonRequest {
            url: &self.config.admin_url,
            query: Vec::new(),
            headers: self.admin_headers.clone(),
            timeout: Some(self.config.admin_timeout),
        };
        Ok(self.http.get_json(&request).await?.body)
    }
}

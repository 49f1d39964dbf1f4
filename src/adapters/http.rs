use crate::config::{IngestConfig, SourceConfig};
use crate::core::rate_limit::RateLimiter;
use crate::core::retry::RetryPolicy;
use crate::domain::model::{FetchBatch, FetchRequest, Record};
use crate::domain::ports::Fetcher;
use crate::utils::error::{IngestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::Extensions;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use reqwest_retry::Retryable;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = concat!("market-ingest/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

/// Expands the endpoint template into one request per symbol. Endpoints
/// without a `{symbol}` placeholder produce a single request.
pub fn build_requests(source: &SourceConfig) -> Result<Vec<FetchRequest>> {
    let mut requests = Vec::new();

    if source.endpoint.contains("{symbol}") {
        for symbol in &source.symbols {
            let symbol = symbol.trim();
            if requests
                .iter()
                .any(|r: &FetchRequest| r.symbol.as_deref() == Some(symbol))
            {
                continue;
            }
            let encoded: String = url::form_urlencoded::byte_serialize(symbol.as_bytes()).collect();
            requests.push(FetchRequest {
                key: symbol.to_string(),
                url: source.endpoint.replace("{symbol}", &encoded),
                symbol: Some(symbol.to_string()),
            });
        }
    } else {
        if !source.symbols.is_empty() {
            tracing::warn!(
                "source.symbols is set but the endpoint has no {{symbol}} placeholder; making a single request"
            );
        }
        requests.push(FetchRequest {
            key: source.endpoint.clone(),
            url: source.endpoint.clone(),
            symbol: None,
        });
    }

    // 檢查是否還有未替換的參數
    for request in &requests {
        if let (Some(open), Some(close)) = (request.url.find('{'), request.url.rfind('}')) {
            if open < close {
                return Err(IngestError::ConfigValidationError {
                    field: "source.endpoint".to_string(),
                    message: format!("Unresolved parameters in endpoint: {}", request.url),
                });
            }
        }
    }

    Ok(requests)
}

/// Extracts records from a decoded response body.
pub fn extract_records(body: Value, records_path: Option<&str>) -> Result<Vec<Record>> {
    let target = match records_path {
        Some(path) => {
            let mut current = body;
            for part in path.split('.') {
                current = match current {
                    Value::Object(mut obj) => {
                        obj.remove(part)
                            .ok_or_else(|| IngestError::ProcessingError {
                                message: format!("records_path '{}' not found in response", path),
                            })?
                    }
                    _ => {
                        return Err(IngestError::ProcessingError {
                            message: format!("records_path '{}' does not point into an object", path),
                        })
                    }
                };
            }
            current
        }
        None => body,
    };

    match target {
        Value::Array(items) => {
            let total = items.len();
            let records: Vec<Record> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(obj) => Some(Record::from_object(obj)),
                    _ => None,
                })
                .collect();
            if records.len() < total {
                tracing::warn!("Skipped {} non-object array elements", total - records.len());
            }
            Ok(records)
        }
        Value::Object(obj) => Ok(vec![Record::from_object(obj)]),
        Value::Null => Ok(Vec::new()),
        other => Err(IngestError::ProcessingError {
            message: format!("Expected an object or array of objects, got: {}", other),
        }),
    }
}

/// Reads a `Retry-After` value in either delay-seconds or HTTP-date form.
fn retry_after_from_header(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    retry_after_from_header(value, Utc::now())
}

fn is_transient(response: &Response) -> bool {
    reqwest_retry::default_on_request_success(response) == Some(Retryable::Transient)
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        text.truncate(cut);
    }
    text
}

/// Takes one rate-limit permit per outgoing HTTP request, retries included.
struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        self.limiter.acquire().await;
        next.run(req, extensions).await
    }
}

/// `Fetcher` over HTTP JSON APIs with shared rate limiting and retries.
pub struct HttpFetcher {
    client: ClientWithMiddleware,
    source: SourceConfig,
    method: Method,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(source: SourceConfig, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Result<Self> {
        let method = match source.method.as_deref().map(str::to_uppercase).as_deref() {
            None | Some("GET") => Method::GET,
            Some("POST") => Method::POST,
            Some(other) => {
                return Err(IngestError::InvalidConfigValueError {
                    field: "source.method".to_string(),
                    value: other.to_string(),
                    reason: "Unsupported method. Valid values: GET, POST".to_string(),
                })
            }
        };

        let mut builder = Client::builder().user_agent(
            source
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        );
        if let Some(timeout) = source.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = ClientBuilder::new(builder.build()?)
            .with(RateLimitMiddleware { limiter })
            .build();

        Ok(Self {
            client,
            source,
            method,
            retry,
        })
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit)?);
        let retry = RetryPolicy::from_config(&config.retry)?;
        Self::new(config.source.clone(), limiter, retry)
    }

    async fn attempt(&self, request: &FetchRequest, attempt: u32) -> Result<Vec<Record>> {
        tracing::debug!("📡 {} attempt {}: {}", request.key, attempt, request.url);

        let mut builder = self.client.request(self.method.clone(), &request.url);

        // 添加自定義標頭
        if let Some(headers) = &self.source.headers {
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }

        // 添加查詢參數
        if let Some(params) = &self.source.parameters {
            builder = builder.query(params);
        }

        let response = builder.send().await?;
        let status = response.status();
        tracing::debug!("📡 {} response status: {}", request.key, status);

        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let transient = is_transient(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::HttpStatusError {
                url: request.url.clone(),
                status: status.as_u16(),
                retry_after,
                body: truncate_chars(body, MAX_ERROR_BODY),
                transient,
            });
        }

        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text)?;
        let mut records = extract_records(body, self.source.records_path.as_deref())?;

        if let Some(symbol) = &request.symbol {
            for record in &mut records {
                if record.is_missing("symbol") {
                    record.insert("symbol", symbol.as_str());
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch> {
        let (records, attempts) = self
            .retry
            .run(&request.url, |attempt| self.attempt(request, attempt))
            .await?;

        tracing::info!(
            "📥 {}: fetched {} records ({} attempt{})",
            request.key,
            records.len(),
            attempts,
            if attempts == 1 { "" } else { "s" }
        );

        Ok(FetchBatch {
            request: request.clone(),
            records,
            attempts,
            fetched_at: Utc::now(),
        })
    }
}

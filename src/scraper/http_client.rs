use super::{PageContent, PageSource};
use crate::config::RegisterConfig;
use crate::error::{ConfigurationError, FetchError};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

/// How a response status is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::Transient
    } else {
        StatusClass::Fatal
    }
}

/// Failure of a single attempt; `retryable` drives the retry condition.
#[derive(Debug)]
struct AttemptError {
    status: Option<u16>,
    reason: String,
    retryable: bool,
}

impl AttemptError {
    fn transient(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into(), retryable: true }
    }

    fn fatal(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into(), retryable: false }
    }
}

/// Page fetcher with politeness delay, bounded retries, exponential backoff
/// with jitter, and a content-signature check on every accepted body.
pub struct HttpClient {
    inner: reqwest::Client,
    config: RegisterConfig,
}

impl HttpClient {
    pub fn new(config: &RegisterConfig) -> Result<Self, ConfigurationError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConfigurationError::InvalidHeader { name: name.clone(), message: e.to_string() }
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                ConfigurationError::InvalidHeader { name: name.clone(), message: e.to_string() }
            })?;
            headers.insert(header_name, header_value);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true);

        builder = match &config.proxy_url {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };

        Ok(Self {
            inner: builder.build()?,
            config: config.clone(),
        })
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.config.initial_backoff_ms / 2)
            .max_delay(Duration::from_millis(self.config.max_backoff_ms))
            .map(jitter)
            .take(self.config.max_retries as usize)
    }

    fn has_signature(&self, body: &str) -> bool {
        if body.trim().is_empty() {
            return false;
        }
        let marker = self.config.content_marker.trim();
        marker.is_empty() || body.to_lowercase().contains(&marker.to_lowercase())
    }

    async fn attempt(&self, url: &str) -> Result<PageContent, AttemptError> {
        self.polite_delay().await;

        let resp = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::transient(None, format!("request error: {}", e)))?;

        let status = resp.status();
        match classify_status(status) {
            StatusClass::Success => {}
            StatusClass::Transient => {
                return Err(AttemptError::transient(Some(status.as_u16()), format!("HTTP {}", status)));
            }
            StatusClass::Fatal => {
                return Err(AttemptError::fatal(Some(status.as_u16()), format!("HTTP {}", status)));
            }
        }

        let body = resp.text().await.map_err(|e| {
            AttemptError::transient(Some(status.as_u16()), format!("body read failed: {}", e))
        })?;

        // Under load the register serves placeholder pages with a 200.
        if !self.has_signature(&body) {
            return Err(AttemptError::transient(
                Some(status.as_u16()),
                "response is missing the expected content signature",
            ));
        }

        Ok(PageContent {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let total = Duration::from_millis(self.config.request_delay_ms)
            + jitter(Duration::from_millis(self.config.jitter_ms));
        if !total.is_zero() {
            sleep(total).await;
        }
    }
}

#[async_trait]
impl PageSource for HttpClient {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError> {
        let mut attempts = 0u32;

        let outcome = RetryIf::start(
            self.backoff(),
            || {
                attempts += 1;
                debug!(url, attempt = attempts, "GET");
                self.attempt(url)
            },
            |e: &AttemptError| {
                if e.retryable {
                    warn!(url, status = ?e.status, "transient failure, retrying: {}", e.reason);
                }
                e.retryable
            },
        )
        .await;

        outcome.map_err(|e| FetchError {
            url: url.to_string(),
            last_status: e.status,
            attempts,
            reason: e.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PAGE: &str = "<html><title>EU Clinical Trials Register</title><body>ok</body></html>";

    /// Serve one scripted (status, body) per connection; the last entry repeats.
    async fn scripted_server(script: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script[n.min(script.len() - 1)];

                let mut buf = vec![0u8; 4096];
                let mut read = Vec::new();
                while !read.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(k) => read.extend_from_slice(&buf[..k]),
                    }
                }

                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/page", addr), hits)
    }

    fn fast_config() -> RegisterConfig {
        RegisterConfig {
            request_delay_ms: 0,
            jitter_ms: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            timeout_secs: 5,
            ..RegisterConfig::default()
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), StatusClass::Transient);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), StatusClass::Transient);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), StatusClass::Fatal);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), StatusClass::Fatal);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = RegisterConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 3000,
            max_retries: 5,
            ..RegisterConfig::default()
        };
        let client = HttpClient::new(&config).unwrap();
        let delays: Vec<Duration> = client.backoff().collect();
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(3000)));
    }

    #[test]
    fn test_signature_check() {
        let client = HttpClient::new(&fast_config()).unwrap();
        assert!(client.has_signature(PAGE));
        assert!(!client.has_signature("   "));
        assert!(!client.has_signature("<html>Please wait...</html>"));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (url, hits) = scripted_server(vec![(503, ""), (429, ""), (200, PAGE)]).await;
        let client = HttpClient::new(&fast_config()).unwrap();

        let page = tokio_test::assert_ok!(client.fetch(&url).await);
        assert_eq!(page.status, 200);
        assert!(page.body.contains("ok"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let (url, hits) = scripted_server(vec![(404, "gone")]).await;
        let client = HttpClient::new(&fast_config()).unwrap();

        let err = tokio_test::assert_err!(client.fetch(&url).await);
        assert_eq!(err.last_status, Some(404));
        assert_eq!(err.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let (url, _) = scripted_server(vec![(503, "")]).await;
        let client = HttpClient::new(&fast_config()).unwrap();

        let err = client.fetch(&url).await.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_status, Some(503));
        assert_eq!(err.url, url);
    }

    #[tokio::test]
    async fn test_placeholder_page_is_retried() {
        let (url, hits) =
            scripted_server(vec![(200, "<html>Please wait...</html>"), (200, PAGE)]).await;
        let client = HttpClient::new(&fast_config()).unwrap();

        assert!(client.fetch(&url).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

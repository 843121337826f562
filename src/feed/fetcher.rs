use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

use crate::feed::parser::{parse_feed, ParsedFeed};

/// Errors that can occur while fetching and parsing one feed.
///
/// Any of these is fatal for that fetch cycle only.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Everything a worker needs to fetch one feed. Owned copy, detached from config.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub cookie_header: Option<String>,
    pub user_agent: String,
    pub prefer_magnet: bool,
}

/// Network limits for [`HttpFeedSource`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_feed_size: usize,
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_base_delay * 2^n`
    pub retry_base_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_feed_size: 10 * 1024 * 1024, // 10MB
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Source of parsed feeds.
///
/// The scheduler only talks to this trait so tests can substitute canned feeds.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<ParsedFeed, FetchError>;
}

/// Fetches feeds over HTTP(S) and parses them with `feed-rs`.
#[derive(Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl HttpFeedSource {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(create_redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn with_client(client: reqwest::Client, settings: FetchSettings) -> Self {
        Self { client, settings }
    }

    async fn download(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
        let max_retries = self.settings.max_retries;
        let mut retry_count = 0;

        loop {
            let mut builder = self.client.get(&request.url);
            if !request.user_agent.is_empty() {
                builder = builder.header(USER_AGENT, &request.user_agent);
            }
            if let Some(cookie) = &request.cookie_header {
                builder = builder.header(COOKIE, cookie);
            }

            let response = tokio::time::timeout(self.settings.timeout, builder.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();
            let retryable = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= max_retries {
                    return Err(FetchError::RateLimited(max_retries));
                }
                true
            } else if status.is_server_error() {
                if retry_count >= max_retries {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                true
            } else if !status.is_success() {
                // 4xx errors fail immediately
                return Err(FetchError::HttpStatus(status.as_u16()));
            } else {
                false
            };

            if !retryable {
                match read_limited_bytes(response, self.settings.max_feed_size).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(FetchError::IncompleteResponse { expected, received })
                        if retry_count < max_retries =>
                    {
                        tracing::debug!(
                            feed = %request.url,
                            expected = expected,
                            received = received,
                            attempt = retry_count + 1,
                            "Retrying incomplete download"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::warn!(
                    feed = %request.url,
                    status = %status,
                    retry = retry_count,
                    "Feed request failed, retrying after delay"
                );
            }

            let delay = self
                .settings
                .retry_base_delay
                .saturating_mul(2u32.saturating_pow(retry_count));
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<ParsedFeed, FetchError> {
        tracing::info!(
            feed = %request.url,
            cookies = request.cookie_header.is_some(),
            "Fetching feed"
        );
        let bytes = self.download(request).await?;
        let parsed = parse_feed(&bytes, request.prefer_magnet)
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        if let Some(bozo) = &parsed.bozo_exception {
            tracing::warn!(feed = %request.url, problem = %bozo, "Feed parsed with problems");
        }
        Ok(parsed)
    }
}

/// Redirect policy for feed requests.
///
/// Limits redirects to 3 hops and rejects loops.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
    <item><title>Test</title><link>https://a.example/1.torrent</link></item>
</channel></rss>"#;

    fn source() -> HttpFeedSource {
        HttpFeedSource::new(FetchSettings {
            retry_base_delay: Duration::from_millis(1),
            ..FetchSettings::default()
        })
        .unwrap()
    }

    fn request(url: String) -> FetchRequest {
        FetchRequest {
            url,
            cookie_header: None,
            user_agent: String::new(),
            prefer_magnet: false,
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let parsed = source()
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await
            .unwrap();
        assert_eq!(parsed.items.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_sends_cookie_and_user_agent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("cookie", "pass=ab; uid=12"))
            .and(header("user-agent", "feedwatch-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut req = request(format!("{}/feed", mock_server.uri()));
        req.cookie_header = Some("pass=ab; uid=12".into());
        req.user_agent = "feedwatch-test".into();
        assert!(source().fetch(&req).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = source()
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await;
        match result {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_500_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let result = source()
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await;
        match result {
            Err(FetchError::HttpStatus(500)) => {}
            other => panic!("Expected HttpStatus(500), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_429_rate_limited() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let result = source()
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await;
        assert!(matches!(result, Err(FetchError::RateLimited(3))));
    }

    #[tokio::test]
    async fn test_fetch_503_retry_then_success() {
        use wiremock::matchers::any;

        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let parsed = source()
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await
            .unwrap();
        assert_eq!(parsed.items.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let result = source()
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await;
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let small = HttpFeedSource::new(FetchSettings {
            max_feed_size: 16,
            ..FetchSettings::default()
        })
        .unwrap();
        let result = small
            .fetch(&request(format!("{}/feed", mock_server.uri())))
            .await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }
}

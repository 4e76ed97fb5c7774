//! HTTP client with connection pooling and retry logic

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use zipline_errors::{Error, NetworkError};

/// Network client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            user_agent: format!("zipline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// HTTP client wrapper with retry logic
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpConfig,
}

impl HttpClient {
    /// Create a new network client
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to
    /// initialize.
    pub fn new(config: HttpConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| NetworkError::ConnectionRefused(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Create with default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created with
    /// default settings.
    pub fn with_defaults() -> Result<Self, Error> {
        Self::new(HttpConfig::default())
    }

    /// Download the bytes at a URL with retries.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::HttpStatus` for responses with status
    /// >= 400, or a transport error after all retry attempts.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self.retry_request(|| self.client.get(url).send()).await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(NetworkError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let bytes = response.bytes().await.map_err(|e| NetworkError::FetchFailed {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        Ok(bytes.to_vec())
    }

    /// Resolve a possibly-relative URL against a base URL.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::InvalidUrl` if either URL is malformed.
    pub fn resolve(&self, base_url: &str, relative_url: &str) -> Result<String, Error> {
        let base = url::Url::parse(base_url)
            .map_err(|e| NetworkError::InvalidUrl(format!("{base_url}: {e}")))?;
        let resolved = base
            .join(relative_url)
            .map_err(|e| NetworkError::InvalidUrl(format!("{relative_url}: {e}")))?;
        Ok(resolved.into())
    }

    /// Execute a request with retries
    async fn retry_request<F, Fut>(&self, mut f: F) -> Result<Response, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Response, reqwest::Error>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }

            match f().await {
                Ok(response) => {
                    if response.status() == StatusCode::TOO_MANY_REQUESTS {
                        if let Some(retry_after) = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                        {
                            return Err(NetworkError::RateLimited {
                                seconds: retry_after,
                            }
                            .into());
                        }
                    }

                    return Ok(response);
                }
                Err(e) => {
                    let retryable = Self::should_retry(&e);
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(e) if e.is_timeout() => Err(NetworkError::Timeout {
                url: e
                    .url()
                    .map(std::string::ToString::to_string)
                    .unwrap_or_default(),
            }
            .into()),
            Some(e) if e.is_connect() => Err(NetworkError::ConnectionRefused(e.to_string()).into()),
            Some(e) => Err(NetworkError::FetchFailed {
                url: e
                    .url()
                    .map(std::string::ToString::to_string)
                    .unwrap_or_default(),
                message: e.to_string(),
            }
            .into()),
            None => Err(NetworkError::FetchFailed {
                url: String::new(),
                message: "unknown error".to_string(),
            }
            .into()),
        }
    }

    /// Determine if an error should be retried
    fn should_retry(error: &reqwest::Error) -> bool {
        // Retry on timeout, connection errors, and server errors
        error.is_timeout()
            || error.is_connect()
            || error.status().is_none_or(|s| s.is_server_error())
    }
}

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::error::FetchError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub content: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into [`FetchError::Status`].
    pub fn into_content(self, url: &Url) -> Result<String, FetchError> {
        if self.is_success() {
            Ok(self.content)
        } else {
            Err(FetchError::status(url.as_str(), self.status))
        }
    }
}

/// Capability used by the pipeline to reach the source.
///
/// Implementations share one session; the pipeline never calls them
/// concurrently.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, locator: &Url, timeout: Duration) -> Result<FetchResponse, FetchError>;

    /// Lightweight existence check returning the response status.
    async fn probe(&self, locator: &Url, timeout: Duration) -> Result<u16, FetchError> {
        Ok(self.fetch(locator, timeout).await?.status)
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(user_agent: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| FetchError::Other {
                url: String::new(),
                message: format!("build http client: {err}"),
            })?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }

    async fn send(
        &self,
        method: reqwest::Method,
        locator: &Url,
        timeout: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        self.client
            .request(method, locator.clone())
            .timeout(timeout)
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|err| classify_reqwest_error(locator, &err))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, locator: &Url, timeout: Duration) -> Result<FetchResponse, FetchError> {
        tracing::debug!(url = %locator, "GET");
        let response = self.send(reqwest::Method::GET, locator, timeout).await?;
        let status = response.status().as_u16();
        let content = response
            .text()
            .await
            .map_err(|err| classify_reqwest_error(locator, &err))?;
        Ok(FetchResponse { status, content })
    }

    async fn probe(&self, locator: &Url, timeout: Duration) -> Result<u16, FetchError> {
        let response = self.send(reqwest::Method::HEAD, locator, timeout).await?;
        let status = response.status().as_u16();
        if status == 405 || status == 501 {
            let response = self.send(reqwest::Method::GET, locator, timeout).await?;
            return Ok(response.status().as_u16());
        }
        Ok(status)
    }
}

fn classify_reqwest_error(locator: &Url, err: &reqwest::Error) -> FetchError {
    let url = locator.to_string();
    let message = error_chain(err);
    if err.is_timeout() {
        return FetchError::Timeout { url };
    }
    if err.is_connect() {
        let lower = message.to_ascii_lowercase();
        if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
            return FetchError::Dns { url, message };
        }
        return FetchError::Connection { url, message };
    }
    if err.is_request() || err.is_body() {
        return FetchError::Connection { url, message };
    }
    FetchError::Other { url, message }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

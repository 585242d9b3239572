//! Shared plumbing for remote embedding and completion providers

use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::error::{CallError, Error, Result};

/// Bounded exponential backoff with a timeout on every attempt
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            attempt_timeout,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. A timed-out attempt counts as retryable.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> std::result::Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let mut last_err = None;

        for attempt in 0..self.max_attempts {
            let outcome = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::transient(format!(
                    "{} timed out after {:?}",
                    what, self.attempt_timeout
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt + 1 < self.max_attempts => {
                    let delay = self.base_backoff * (1u32 << attempt.min(16));
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt + 1,
                        self.max_attempts,
                        err,
                        delay
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| CallError::fatal(format!("{} was never attempted", what))))
    }
}

/// Join a path onto an API base without dropping the base's last segment
pub fn endpoint(base: &str, path: &str) -> Result<Url> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| Error::Config(format!("Invalid provider URL: {}", e)))
}

/// HTTP client shared by the provider adapters
pub fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .user_agent(concat!("leadq/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Send a JSON request and decode a JSON response, classifying failures
pub async fn post_json<B, T>(
    client: &Client,
    url: Url,
    api_key: Option<&str>,
    body: &B,
) -> std::result::Result<T, CallError>
where
    B: serde::Serialize + ?Sized,
    T: serde::de::DeserializeOwned,
{
    let mut request = client.post(url).json(body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| CallError::from_reqwest(&e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(300).collect();
        return Err(CallError::from_status(
            status.as_u16(),
            format!("provider returned {}: {}", status, snippet),
        ));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| CallError::fatal(format!("unreadable provider response: {}", e)))
}

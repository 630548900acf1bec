//! Shared retrying HTTP transport: exponential backoff, min 1 s, max 60 s,
//! up to 10 attempts, used by FileStream, Uploader, and the GraphQL client.

use std::time::Duration;

use backoff::ExponentialBackoff;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response};

pub const USER_AGENT_VALUE: &str = "wandb-nexus";
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("request failed after {MAX_ATTEMPTS} attempts: {0}")]
    Exhausted(#[source] reqwest::Error),
}

fn backoff_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

pub fn basic_auth_header(api_key: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("api:{api_key}")))
}

/// Thin wrapper around a `reqwest::Client` that retries transient failures
/// with exponential backoff and stamps every request with the auth and
/// user-agent headers the backend expects.
#[derive(Clone)]
pub struct RetryingTransport {
    client: Client,
    api_key: Option<String>,
}

impl RetryingTransport {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(USER_AGENT, USER_AGENT_VALUE);
        match &self.api_key {
            Some(key) => builder.header(AUTHORIZATION, basic_auth_header(key)),
            None => builder,
        }
    }

    pub async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<Response, RetryError> {
        let mut attempt = 0u32;
        let mut backoff = backoff_policy();
        loop {
            attempt += 1;
            let result = self
                .authorize(self.client.post(url).json(&body))
                .send()
                .await
                .and_then(Response::error_for_status);

            match result {
                Ok(response) => return Ok(response),
                Err(error) if attempt < MAX_ATTEMPTS => {
                    let delay = backoff::backoff::Backoff::next_backoff(&mut backoff).unwrap_or(Duration::from_secs(60));
                    warn!(attempt, %error, "retrying request after backoff");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(RetryError::Exhausted(error)),
            }
        }
    }

    pub async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
    ) -> Result<Response, RetryError> {
        let mut attempt = 0u32;
        let mut backoff = backoff_policy();
        loop {
            attempt += 1;
            let mut builder = self.client.put(url).body(body.clone());
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let result = builder.send().await.and_then(Response::error_for_status);

            match result {
                Ok(response) => return Ok(response),
                Err(error) if attempt < MAX_ATTEMPTS => {
                    let delay = backoff::backoff::Backoff::next_backoff(&mut backoff).unwrap_or(Duration::from_secs(60));
                    warn!(attempt, %error, "retrying upload after backoff");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(RetryError::Exhausted(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_is_base64_of_api_colon_key() {
        let header = basic_auth_header("k");
        assert_eq!(header, format!("Basic {}", BASE64.encode("api:k")));
    }
}

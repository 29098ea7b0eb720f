//! HTTP plumbing for talking to downstream services.

use std::time::Duration;

use http::HeaderMap;
use serde_json::Value;

use crate::graphql;

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What a downstream call is for; ends up in the User-Agent.
#[derive(Clone, Copy, Debug)]
pub enum Purpose {
    Update,
    Query,
}

impl Purpose {
    fn suffix(self) -> &'static str {
        match self {
            Purpose::Update => "update",
            Purpose::Query => "query",
        }
    }
}

/// A client with a short idle pool and the gateway's User-Agent.
pub fn client(purpose: Purpose, timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(format!("Bramble/{GATEWAY_VERSION} ({})", purpose.suffix()))
        .pool_idle_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .expect("the downstream client configuration is static")
}

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("downstream request timed out")]
    Timeout,
    #[error("error during request: {0}")]
    Transport(String),
    #[error("downstream returned status {0}")]
    Status(u16),
    #[error("response exceeded maximum size of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("error parsing response body: {0}")]
    Json(String),
}

impl From<reqwest::Error> for DownstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownstreamError::Timeout
        } else {
            DownstreamError::Transport(err.to_string())
        }
    }
}

/// POSTs one GraphQL document and parses the standard response envelope,
/// clamping the body at `max_body_size`.
pub async fn post_graphql(
    client: &reqwest::Client,
    url: &str,
    request: &graphql::Request,
    headers: HeaderMap,
    max_body_size: usize,
) -> Result<graphql::Response, DownstreamError> {
    let response = client
        .post(url)
        .headers(headers)
        .json(request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownstreamError::Status(status.as_u16()));
    }

    let body = response.bytes().await?;
    if body.len() > max_body_size {
        return Err(DownstreamError::TooLarge {
            limit: max_body_size,
        });
    }
    serde_json::from_slice(&body).map_err(|err| DownstreamError::Json(err.to_string()))
}

/// Pulls a string field out of a `{ service { … } }` poll response.
pub fn service_field<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get("service")?.get(field)?.as_str()
}

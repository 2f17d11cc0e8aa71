//! Hook delivery endpoints.
//!
//! `http://` and `https://` endpoints receive event messages as JSON POST
//! bodies, best effort. `queue://host:port/name` endpoints are parsed and
//! validated for compatibility, but delivery to message queues lives
//! outside this process; sending to one only logs the message.

use std::time::Duration;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Http,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    /// The URL exactly as the client supplied it.
    pub original: String,
    /// Queue endpoints only: target queue name.
    pub queue_name: Option<String>,
}

/// Parse one endpoint URL.
pub fn parse_endpoint(s: &str) -> Result<Endpoint> {
    let lower = s.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let rest = &s[s.find("//").map(|i| i + 2).unwrap_or(0)..];
        if rest.is_empty() || rest.starts_with('/') {
            return Err(ServerError::invalid_argument(s));
        }
        return Ok(Endpoint {
            kind: EndpointKind::Http,
            original: s.to_string(),
            queue_name: None,
        });
    }
    if let Some(rest) = lower.strip_prefix("queue://") {
        let mut parts = rest.splitn(2, '/');
        let host = parts.next().unwrap_or("");
        if host.is_empty() {
            return Err(ServerError::invalid_argument(s));
        }
        let name = parts.next().unwrap_or("");
        if name.is_empty() {
            return Err(ServerError::invalid_argument(s));
        }
        return Ok(Endpoint {
            kind: EndpointKind::Queue,
            original: s.to_string(),
            queue_name: Some(name.to_string()),
        });
    }
    Err(ServerError::invalid_argument(s))
}

/// Parse a comma-separated endpoint list.
pub fn parse_endpoints(s: &str) -> Result<Vec<Endpoint>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        out.push(parse_endpoint(part)?);
    }
    Ok(out)
}

/// Best-effort delivery of fence messages to hook endpoints.
#[derive(Debug, Clone)]
pub struct EndpointManager {
    client: reqwest::Client,
}

impl Default for EndpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointManager {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        EndpointManager { client }
    }

    /// Deliver `body` to one endpoint. Failures are returned so the
    /// synchronous hook mode can revert; the async dispatcher just logs
    /// them.
    pub async fn send(&self, endpoint: &Endpoint, body: &str) -> Result<()> {
        match endpoint.kind {
            EndpointKind::Http => {
                let resp = self
                    .client
                    .post(&endpoint.original)
                    .header("Content-Type", "application/json")
                    .body(body.to_string())
                    .send()
                    .await
                    .map_err(|e| ServerError::other(format!("endpoint: {e}")))?;
                if !resp.status().is_success() {
                    return Err(ServerError::other(format!(
                        "endpoint returned status code {}",
                        resp.status().as_u16()
                    )));
                }
                Ok(())
            }
            EndpointKind::Queue => {
                tracing::debug!(
                    endpoint = %endpoint.original,
                    queue = endpoint.queue_name.as_deref().unwrap_or(""),
                    "queue delivery handled externally"
                );
                Ok(())
            }
        }
    }
}

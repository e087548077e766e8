//! Thin transport seam over the Proxmox HTTP API.
//!
//! `ProxmoxClient` never touches `reqwest` directly; it talks to this
//! trait so tests can swap in a scripted fake, the same discipline the
//! teacher applies to `ShellExecutor`/`CommandRunner` (a trait boundary
//! around the one thing that is expensive or impossible to exercise for
//! real in a unit test).

#![allow(async_fn_in_trait)]

use std::time::Duration;

use vessel_common::CoreError;

/// HTTP verb. Proxmox only ever needs these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// The raw, undecoded result of one HTTP round trip.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Everything `ProxmoxClient::do_request` needs from a transport: issue
/// one request, carrying the token auth header and an optional
/// already-encoded `application/x-www-form-urlencoded` body.
///
/// A GET request must not set a body or a content type (§6); callers pass
/// `None` for `form_body` in that case.
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        form_body: Option<&str>,
    ) -> Result<RawResponse, CoreError>;
}

/// Credentials for the Proxmox token-authentication scheme: literally
/// `Authorization: PVEAPIToken=<id>=<secret>` (§6).
#[derive(Debug, Clone)]
pub struct ApiToken {
    pub token_id: String,
    pub secret: String,
}

impl ApiToken {
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.secret)
    }
}

/// `reqwest`-backed transport. The only place in this crate that
/// constructs an HTTP client; every call site above it goes through
/// `HttpTransport`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    token: ApiToken,
}

impl ReqwestTransport {
    /// # Errors
    ///
    /// Returns an error if the underlying `reqwest::Client` cannot be
    /// built (e.g. TLS backend initialization failure).
    pub fn new(base_url: impl Into<String>, token: ApiToken, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| CoreError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        form_body: Option<&str>,
    ) -> Result<RawResponse, CoreError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        builder = builder.header("Authorization", self.token.header_value());
        if let Some(body) = form_body {
            builder = builder
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body.to_string());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::Transport(format!("request to {path} failed: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::Transport(format!("failed to read response body from {path}: {e}")))?;
        Ok(RawResponse { status, body })
    }
}

/// Build an `application/x-www-form-urlencoded` body from pairs, percent
/// encoding each value exactly once.
///
/// Callers that need a value to carry Proxmox's own encoding on top
/// (`injectSSHKey`'s `sshkeys` field, §4.4) must encode it themselves
/// before handing it to this function — this function's encoding is the
/// HTTP transport layer, not the application layer, and the two must
/// compose rather than collapse into one pass (a naive implementation
/// that encodes only once here would corrupt a public key's `+`/`/`
/// characters when the caller expected both layers).
#[must_use]
pub fn form_urlencoded_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_body_encodes_plus_and_slash() {
        let body = form_urlencoded_body(&[("sshkeys", "ssh-ed25519 AAAA+b/c== user@host")]);
        assert!(body.starts_with("sshkeys="));
        assert!(!body.contains(' '));
        assert!(body.contains("%2B") || body.contains("%2b"));
    }

    #[test]
    fn token_header_value_matches_proxmox_format() {
        let token = ApiToken { token_id: "user@pve!agent".into(), secret: "abc-123".into() };
        assert_eq!(token.header_value(), "PVEAPIToken=user@pve!agent=abc-123");
    }
}

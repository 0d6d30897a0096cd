//! One-shot HTTP request/response delivery.

use std::time::Duration;
use tracing::debug;

use super::TransportLimits;
use crate::config::NetworkConfig;
use crate::p2p::address::host_for_url;
use crate::p2p::error::TransportError;

/// Counts bytes as they stream in and fails once `limit` is crossed.
#[derive(Debug)]
pub struct SizeLimit {
    limit: usize,
    seen: usize,
}

impl SizeLimit {
    pub fn new(limit: usize) -> Self {
        Self { limit, seen: 0 }
    }

    pub fn feed(&mut self, bytes: usize) -> Result<(), TransportError> {
        self.seen = self.seen.saturating_add(bytes);
        if self.seen > self.limit {
            return Err(TransportError::SizeExceeded { limit: self.limit });
        }
        Ok(())
    }

    pub fn seen(&self) -> usize {
        self.seen
    }
}

pub struct OneShotClient {
    http: reqwest::Client,
    limits: TransportLimits,
    timeout_ms: u64,
}

impl OneShotClient {
    pub fn new(config: &NetworkConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(
                config.connect_timeout_ms + config.read_timeout_ms,
            ))
            .gzip(true)
            .user_agent(format!("{}/{}", crate::version::APPLICATION, crate::version::VERSION));
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| TransportError::Http(e.to_string()))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            http,
            limits: TransportLimits::from_config(config),
            timeout_ms: config.connect_timeout_ms + config.read_timeout_ms,
        })
    }

    /// POST `body` to the peer's `/forge` endpoint and read at most
    /// `max_response` bytes of (decompressed) response.
    pub async fn post(
        &self,
        host: &str,
        port: u16,
        body: Vec<u8>,
        max_response: usize,
    ) -> Result<Vec<u8>, TransportError> {
        if body.len() > self.limits.max_request_size {
            return Err(TransportError::Frame(format!(
                "request of {} bytes exceeds the {} byte limit",
                body.len(),
                self.limits.max_request_size
            )));
        }
        let url = url::Url::parse(&format!("http://{}:{}/forge", host_for_url(host), port))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if !response.status().is_success() {
            return Err(TransportError::Http(format!("status {}", response.status())));
        }
        read_limited(response, max_response.min(self.limits.max_message_size))
            .await
            .map_err(|e| self.classify_read(e))
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        match TransportError::from(err) {
            TransportError::Timeout(_) => TransportError::Timeout(self.timeout_ms),
            other => other,
        }
    }

    fn classify_read(&self, err: TransportError) -> TransportError {
        match err {
            TransportError::Timeout(_) => TransportError::Timeout(self.timeout_ms),
            other => other,
        }
    }
}

/// Read a response body chunk by chunk, failing as soon as it grows past `limit`.
pub async fn read_limited(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut counter = SizeLimit::new(limit);
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        counter.feed(chunk.len())?;
        body.extend_from_slice(&chunk);
    }
    debug!(bytes = counter.seen(), "[TRANSPORT] Read response");
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;

    #[test]
    fn size_limit_trips_past_the_cap() {
        let mut limit = SizeLimit::new(10);
        assert!(limit.feed(6).is_ok());
        assert!(limit.feed(4).is_ok());
        assert!(matches!(
            limit.feed(1),
            Err(TransportError::SizeExceeded { limit: 10 })
        ));
    }

    async fn serve(body: &'static str) -> u16 {
        let app = Router::new().route("/forge", post(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn client() -> OneShotClient {
        OneShotClient::new(&NetworkConfig {
            connect_timeout_ms: 2_000,
            read_timeout_ms: 2_000,
            ..NetworkConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn oversized_response_fails_instead_of_truncating() {
        let big: &'static str = Box::leak("z".repeat(64 * 1024).into_boxed_str());
        let port = serve(big).await;
        let result = client().post("127.0.0.1", port, b"{}".to_vec(), 1024).await;
        assert!(matches!(result, Err(TransportError::SizeExceeded { limit: 1024 })));
    }

    #[tokio::test]
    async fn response_within_cap_is_returned_whole() {
        let port = serve(r#"{"ok":true}"#).await;
        let body = client()
            .post("127.0.0.1", port, b"{}".to_vec(), 1024)
            .await
            .unwrap();
        assert_eq!(body, br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn oversized_request_is_not_sent() {
        let c = client();
        let body = vec![b' '; c.limits.max_request_size + 1];
        assert!(matches!(
            c.post("127.0.0.1", 9, body, 1024).await,
            Err(TransportError::Frame(_))
        ));
    }
}

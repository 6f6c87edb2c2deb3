//! HTTP side of the canvas service: snapshot fetch and draw submission.
//!
//! These two request/response calls live outside the realtime channel. The
//! engine only depends on their results — raw snapshot bytes in, ok/failed
//! out — and authenticates both with the session's bearer token.

use crate::protocol::DrawRequest;

/// Async HTTP client for the canvas API.
#[derive(Clone)]
pub struct CanvasApi {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

/// Error type for API operations.
#[derive(Debug)]
pub enum ApiError {
    /// No stored credential to authenticate with.
    NotAuthenticated,
    /// Network error
    Network(String),
    /// HTTP error with status code
    Http(u16, String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotAuthenticated => write!(f, "Not authenticated — no stored session"),
            ApiError::Network(msg) => write!(f, "Network error: {msg}"),
            ApiError::Http(code, msg) => write!(f, "HTTP {code}: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl CanvasApi {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            token: token.into(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Fetch the packed full-grid snapshot: `ceil(size²/2)` bytes of 4-bit
    /// color indices in raster order. Length validation happens at decode.
    pub async fn fetch_snapshot(&self) -> Result<Vec<u8>, ApiError> {
        let response = self
            .http
            .get(format!("{}/api/grid", self.api_base))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Http(status.as_u16(), body));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Submit one pixel write. The caller has already applied the pixel
    /// optimistically; a failure here is surfaced, not rolled back.
    pub async fn draw(&self, request: &DrawRequest) -> Result<(), ApiError> {
        let response = self
            .http
            .post(format!("{}/api/update", self.api_base))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Http(status.as_u16(), body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-shot HTTP server: answers the first request with the
    /// given status line and body, then closes.
    async fn one_shot_http(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            // Read until the header terminator; request bodies here are tiny.
            let mut seen = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_fetch_snapshot_returns_raw_bytes() {
        let base = one_shot_http("200 OK", &[0x12, 0x34, 0x56, 0x78]).await;
        let api = CanvasApi::new(base, "tok");
        let bytes = api.fetch_snapshot().await.unwrap();
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[tokio::test]
    async fn test_fetch_snapshot_http_error() {
        let base = one_shot_http("401 Unauthorized", b"bad token").await;
        let api = CanvasApi::new(base, "tok");
        match api.fetch_snapshot().await {
            Err(ApiError::Http(401, body)) => assert_eq!(body, "bad token"),
            other => panic!("Expected HTTP 401, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_draw_failure_surfaced() {
        let base = one_shot_http("429 Too Many Requests", b"slow down").await;
        let api = CanvasApi::new(base, "tok");
        let err = api
            .draw(&DrawRequest { x: 1, y: 2, color: 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Http(429, _)));
    }

    #[tokio::test]
    async fn test_draw_ok() {
        let base = one_shot_http("200 OK", b"{}").await;
        let api = CanvasApi::new(base, "tok");
        assert!(api.draw(&DrawRequest { x: 0, y: 0, color: 1 }).await.is_ok());
    }

    #[tokio::test]
    async fn test_network_error() {
        // Nothing listens on port 1.
        let api = CanvasApi::new("http://127.0.0.1:1", "tok");
        assert!(matches!(
            api.fetch_snapshot().await,
            Err(ApiError::Network(_))
        ));
    }
}

//! Sample client — one telemetry fetch from one worker.
//!
//! Every call opens a fresh TCP connection, sends a single GET for the
//! metrics path and drops the connection afterwards. Readings from a
//! reused connection could come from a worker that has since been
//! replaced behind the same address.

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::Authority;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::{ScrapeError, ScrapeResult};
use crate::sample::{Sample, decode_samples};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Fetches telemetry from a single worker address.
#[async_trait]
pub trait SampleClient: Send + Sync {
    /// Fetch the worker's single reading.
    async fn sample(&self, address: &str) -> ScrapeResult<Sample>;

    /// Fetch one reading per logical service hosted at the address.
    async fn bulk_sample(&self, address: &str) -> ScrapeResult<Vec<Sample>>;
}

/// HTTP/1 sample client built on hyper.
#[derive(Debug, Clone)]
pub struct HttpSampleClient {
    port: u16,
    path: String,
    timeout: Duration,
}

impl HttpSampleClient {
    pub fn new(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port` for a worker address.
    ///
    /// An address that already carries a port (`10.0.0.7:8101`,
    /// `pod-a.svc:8101`, `[::1]:8101`) is used as is. A bare host gets the
    /// configured port; a bare IPv6 literal is bracketed first.
    pub fn endpoint(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        if let Ok(ip) = address.parse::<Ipv6Addr>() {
            return SocketAddr::from((ip, self.port)).to_string();
        }
        match address.parse::<Authority>() {
            Ok(authority) if authority.port_u16().is_some() => address.to_string(),
            _ => format!("{address}:{}", self.port),
        }
    }

    async fn fetch(&self, address: &str) -> ScrapeResult<Bytes> {
        let endpoint = self.endpoint(address);
        match tokio::time::timeout(self.timeout, self.fetch_inner(&endpoint)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%endpoint, timeout = ?self.timeout, "sample request timed out");
                Err(unreachable_err(&endpoint, "timed out"))
            }
        }
    }

    async fn fetch_inner(&self, endpoint: &str) -> ScrapeResult<Bytes> {
        let uri = format!("http://{endpoint}{}", self.path);

        let stream = tokio::net::TcpStream::connect(endpoint)
            .await
            .map_err(|e| unreachable_err(endpoint, e))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| unreachable_err(endpoint, e))?;

        // Drive the connection in the background; it ends with the request.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", endpoint)
            .header("connection", "close")
            .header("user-agent", "warpgrid-scraper/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| unreachable_err(endpoint, e))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| unreachable_err(endpoint, e))?;

        if !resp.status().is_success() {
            debug!(status = %resp.status(), %uri, "metrics endpoint returned non-2xx");
            return Err(unreachable_err(endpoint, format!("HTTP status {}", resp.status())));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| unreachable_err(endpoint, e))?
            .to_bytes();
        Ok(body)
    }
}

#[async_trait]
impl SampleClient for HttpSampleClient {
    async fn sample(&self, address: &str) -> ScrapeResult<Sample> {
        let body = self.fetch(address).await?;
        let mut samples = decode_samples(address, &body)?;
        if samples.len() != 1 {
            return Err(ScrapeError::Malformed {
                address: address.to_string(),
                reason: format!("expected one record, got {}", samples.len()),
            });
        }
        Ok(samples.remove(0))
    }

    async fn bulk_sample(&self, address: &str) -> ScrapeResult<Vec<Sample>> {
        let body = self.fetch(address).await?;
        decode_samples(address, &body)
    }
}

fn unreachable_err(endpoint: &str, reason: impl ToString) -> ScrapeError {
    ScrapeError::Unreachable {
        address: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

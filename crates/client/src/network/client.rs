//! Request/reply client for the broker router

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use protocol::{Request, Response, read_multipart_async, write_multipart_async};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// One connection to the broker
///
/// Requests are answered in order, so a single connection never has more
/// than one request in flight.
pub struct BrokerClient {
    stream: TcpStream,
    timeout: Duration,
}

impl BrokerClient {
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", endpoint))?
            .with_context(|| format!("Failed to connect to broker at {}", endpoint))?;
        stream.set_nodelay(true)?;

        debug!("Connected to broker at {}", endpoint);
        Ok(Self { stream, timeout })
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let payload = request.to_json().context("Failed to encode request")?;
        debug!("Sending {}", String::from_utf8_lossy(&payload));

        write_multipart_async(&mut self.stream, &[Bytes::new(), Bytes::from(payload)])
            .await
            .context("Failed to send request")?;

        let frames = tokio::time::timeout(self.timeout, read_multipart_async(&mut self.stream))
            .await
            .map_err(|_| anyhow!("No reply from broker within {:?}", self.timeout))?
            .context("Failed to read reply")?;

        let payload = match frames.as_slice() {
            [delimiter, payload] if delimiter.is_empty() => payload,
            _ => return Err(anyhow!("Unexpected reply shape ({} frames)", frames.len())),
        };
        debug!("Received {}", String::from_utf8_lossy(payload));

        Response::from_json(payload).context("Failed to decode reply")
    }
}

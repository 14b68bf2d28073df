//! HTTP transport used by the SharePoint backend
//!
//! Every Graph call goes through [`GraphTransport::send`], which takes an
//! `http::Request<Bytes>` and yields an `http::Response<Bytes>` with the body
//! already collected into one contiguous buffer. Tests substitute a scripted
//! implementation; production uses [`ReqwestTransport`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::Duration;
use thiserror::Error;

/// Failure to exchange a request with the remote service
///
/// HTTP error statuses are not transport errors; they come back as responses.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, TLS, timeout or body read failure
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response could not be rebuilt as an `http::Response`
    #[error("Invalid HTTP response: {0}")]
    Http(#[from] http::Error),
}

/// Sends fully-buffered HTTP requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphTransport: Send + Sync {
    /// Sends `request` and returns the complete response
    async fn send(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>, TransportError>;
}

/// [`GraphTransport`] backed by a shared `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with a request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be built (for example
    /// when no TLS backend is available).
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GraphTransport for ReqwestTransport {
    async fn send(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>, TransportError> {
        let (parts, body) = request.into_parts();

        let response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();

        // Content downloads may arrive in many frames; callers always get one buffer
        let mut stream = response.bytes_stream();
        let mut collected = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk?);
        }

        let mut builder = http::Response::builder().status(status);
        if let Some(map) = builder.headers_mut() {
            *map = headers;
        }
        Ok(builder.body(collected.freeze())?)
    }
}

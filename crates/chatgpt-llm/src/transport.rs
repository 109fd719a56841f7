//! HTTP transport seam.
//!
//! Clients never talk to reqwest directly: they hand a [`TransportRequest`] to
//! a [`Transport`] and get back a [`TransportResponse`] whose body shape is
//! fixed when the response is built.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use log::{error, info};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Proxy, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{error_chain, ChatGptError, Result};

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
    /// Cancelled when the caller aborts or the request times out.
    pub signal: CancellationToken,
}

/// Response body, tagged by how it can be read.
pub enum ResponseBody {
    /// Pull-based: one chunk per poll.
    Stream(BoxStream<'static, io::Result<Bytes>>),
    /// Reader drained until exhausted.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// No readable body.
    Empty,
}

impl ResponseBody {
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<io::Result<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        ResponseBody::Stream(futures::stream::iter(chunks).boxed())
    }

    /// Chunk stream for incremental reads.
    pub fn into_chunks(self) -> Result<BoxStream<'static, io::Result<Bytes>>> {
        match self {
            ResponseBody::Stream(stream) => Ok(stream),
            ResponseBody::Reader(reader) => Ok(ReaderStream::new(reader).boxed()),
            ResponseBody::Empty => Err(ChatGptError::UnsupportedTransport(
                "response has no readable body".to_string(),
            )),
        }
    }

    /// Read the whole body as text; an empty body reads as "".
    pub async fn text(self) -> Result<String> {
        if matches!(self, ResponseBody::Empty) {
            return Ok(String::new());
        }
        let chunks: Vec<Bytes> = self
            .into_chunks()?
            .try_collect()
            .await
            .map_err(|e| ChatGptError::Stream(e.to_string()))?;
        let bytes = chunks.concat();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Stream(_) => f.write_str("ResponseBody::Stream"),
            ResponseBody::Reader(_) => f.write_str("ResponseBody::Reader"),
            ResponseBody::Empty => f.write_str("ResponseBody::Empty"),
        }
    }
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: ResponseBody) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn status_text(&self) -> String {
        self.status.canonical_reason().unwrap_or_default().to_string()
    }

    pub async fn text(self) -> Result<String> {
        self.body.text().await
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let text = self.body.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Default transport backed by a reqwest [`Client`]. It performs no retries.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Build a client honouring the configured HTTP/HTTPS proxies.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if !config.http_proxy.is_empty() {
            builder = builder.proxy(Proxy::http(&config.http_proxy)?);
        }
        if !config.https_proxy.is_empty() {
            builder = builder.proxy(Proxy::https(&config.https_proxy)?);
        }
        let client = builder
            .build()
            .map_err(|e| ChatGptError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let TransportRequest {
            method,
            url,
            headers,
            body,
            signal: _,
        } = request;

        info!("Sending {} request to {}", method, url);
        let start_time = Instant::now();

        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let message = format!("Failed HTTP request to {}: {}", url, error_chain(&e));
                error!("{}", message);
                ChatGptError::Transport(message)
            })?;

        info!(
            "Got response from {} after {:?} with status {}",
            url,
            start_time.elapsed(),
            response.status()
        );

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(body_read_error)
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body: ResponseBody::Stream(body),
        })
    }
}

/// Messages hyper uses when a body ends before it is complete.
const INCOMPLETE_BODY_PATTERNS: [&str; 4] = [
    "unexpected eof",
    "end of file before message length reached",
    "connection closed before message completed",
    "incomplete message",
];

/// Kind to report for a body read failure.
///
/// An inner io kind wins; a bare `Other` falls back to the incomplete-body
/// message patterns.
fn body_error_kind(cause: Option<io::ErrorKind>, message: &str) -> io::ErrorKind {
    match cause {
        Some(kind) if kind != io::ErrorKind::Other => kind,
        _ => {
            let lower = message.to_lowercase();
            if INCOMPLETE_BODY_PATTERNS.iter().any(|p| lower.contains(p)) {
                io::ErrorKind::UnexpectedEof
            } else {
                io::ErrorKind::Other
            }
        }
    }
}

/// Convert a reqwest body error, keeping the kind of the io error beneath it.
fn body_read_error(err: reqwest::Error) -> io::Error {
    let message = error_chain(&err);
    let mut cause_kind = None;
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            cause_kind = Some(io_err.kind());
            break;
        }
        source = cause.source();
    }
    io::Error::new(body_error_kind(cause_kind, &message), message)
}

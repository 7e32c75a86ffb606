//! Ranged object reads over HTTP.
//!
//! Objects live under a container URL: `{container}/{object}`. A query string
//! on the container URL (a shared-access signature, for example) is appended
//! to every request.

use std::time::Duration;

use blobferry_transfer::ObjectSource;
use blobferry_transfer::source::TransferFuture;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use tracing::warn;

use crate::error::BackendError;

/// Characters left as-is in an object path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Transport timeouts applied to every request.
///
/// `read` bounds each wait for data on an open connection, not the whole
/// response, so large ranges are not cut off while bytes keep arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(300),
            read: Duration::from_secs(300),
        }
    }
}

/// An [`ObjectSource`] backed by `HEAD` and `Range` requests.
pub struct HttpRangeSource {
    http: reqwest::Client,
    base_url: String,
    query: Option<String>,
}

impl HttpRangeSource {
    /// Creates a source for objects under `container_url`.
    ///
    /// A stalled connection fails with a timeout, reported as a transient
    /// [`TransferError::SourceRead`](blobferry_transfer::TransferError::SourceRead).
    pub fn new(container_url: &str, timeouts: HttpTimeouts) -> Result<Self, BackendError> {
        let (base, query) = match container_url.split_once('?') {
            Some((base, query)) => (base, Some(query).filter(|q| !q.is_empty())),
            None => (container_url, None),
        };
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(BackendError::InvalidUrl(format!(
                "expected an http(s) URL, got {base:?}"
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("blobferry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .build()?;

        Ok(Self {
            http,
            base_url: base.trim_end_matches('/').to_string(),
            query: query.map(str::to_string),
        })
    }

    /// Full URL of `object`, each path segment percent-encoded.
    pub fn object_url(&self, object: &str) -> String {
        let path = object
            .split('/')
            .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        match &self.query {
            Some(query) => format!("{}/{path}?{query}", self.base_url),
            None => format!("{}/{path}", self.base_url),
        }
    }

    /// Size of `object` from the `Content-Length` of a `HEAD` response.
    pub async fn content_length(&self, object: &str) -> Result<u64, BackendError> {
        let resp = self.http.head(self.object_url(object)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        // Read the header itself; the body length of a HEAD response is zero.
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| BackendError::InvalidResponse("missing Content-Length".into()))
    }

    /// Fetches `len` bytes of `object` starting at `offset`.
    pub async fn get_range(
        &self,
        object: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset
            .checked_add(len - 1)
            .ok_or_else(|| BackendError::InvalidResponse(format!("range overflows at {offset}")))?;

        let resp = self
            .http
            .get(self.object_url(object))
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp.bytes().await?.to_vec()),
            // A plain 200 is only usable when the range is the whole body.
            StatusCode::OK if offset == 0 && resp.content_length() == Some(len) => {
                Ok(resp.bytes().await?.to_vec())
            }
            StatusCode::OK => {
                warn!(object, offset, end, "server ignored Range");
                Err(BackendError::InvalidResponse(format!(
                    "server ignored Range bytes={offset}-{end}"
                )))
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(BackendError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

impl ObjectSource for HttpRangeSource {
    fn size<'a>(&'a self, object: &'a str) -> TransferFuture<'a, u64> {
        Box::pin(async move {
            self.content_length(object)
                .await
                .map_err(BackendError::into_source_error)
        })
    }

    fn read_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        len: u64,
    ) -> TransferFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.get_range(object, offset, len)
                .await
                .map_err(BackendError::into_source_error)
        })
    }
}

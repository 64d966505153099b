//! HTTP transfer plumbing
//!
//! Connection setup and range-request resume classification for the
//! manager's transfer tasks. The server's answer to a `Range: bytes=N-`
//! request decides whether a partial file continues or restarts:
//! `206 Partial Content` appends, a plain `200 OK` rewrites from scratch.

use crate::config::HttpConfig;
use crate::error::{ManagerError, NetworkErrorKind, Result};
use crate::types::DownloadRecord;
use reqwest::{Client, Response, StatusCode};
use std::ops::Range;
use std::time::Duration;

/// Build the shared HTTP client with bounded timeouts
pub(crate) fn build_client(config: &HttpConfig) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .read_timeout(Duration::from_secs(config.read_timeout))
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .build()
        .map_err(|e| ManagerError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// An opened transfer, classified for resume
pub(crate) struct TransferPlan {
    /// The in-flight response whose body is streamed
    pub response: Response,
    /// Byte offset the transfer continues from (0 = fresh file)
    pub resumed_from: u64,
    /// Expected final file size; 0 when the server reported no length
    pub total_bytes: u64,
}

/// Range header value for resuming at `start`
pub(crate) fn range_header(start: u64) -> String {
    format!("bytes={}-", start)
}

/// Content-Length of a response, if reported
fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Open the connection for a record and classify the resume situation.
///
/// When the destination file already holds partial bytes, a range request
/// is issued starting at the existing length. A `206` response continues
/// from there; any other success means the server ignored the range and
/// the file restarts from this response.
pub(crate) async fn open_transfer(
    client: &Client,
    record: &DownloadRecord,
    user_agent: &str,
) -> Result<TransferPlan> {
    let destination = record.destination();
    let existing = match tokio::fs::metadata(&destination).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client
        .get(record.request.url.as_str())
        .header("User-Agent", user_agent);

    for (name, value) in &record.request.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    if existing > 0 {
        request = request.header("Range", range_header(existing));
    }

    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ManagerError::network(
            NetworkErrorKind::HttpStatus(status.as_u16()),
            format!("HTTP error: {}", status),
        ));
    }

    let reported = content_length(&response);
    let (resumed_from, total_bytes) = if existing > 0 && status == StatusCode::PARTIAL_CONTENT {
        // Remaining length on top of what is already on disk
        (existing, reported.map(|rest| existing + rest).unwrap_or(0))
    } else {
        (0, reported.unwrap_or(0))
    };

    Ok(TransferPlan {
        response,
        resumed_from,
        total_bytes,
    })
}

/// Split a received buffer into throttle-granularity spans
pub(crate) fn chunk_spans(len: usize, max: usize) -> impl Iterator<Item = Range<usize>> {
    let max = max.max(1);
    (0..len)
        .step_by(max)
        .map(move |start| start..(start + max).min(len))
}

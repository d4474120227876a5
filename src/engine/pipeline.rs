//! The per-item fetch state machine: one attempt, start to finish.
//!
//! `super` owns the retry *loop*; this module is the body of a single
//! attempt, covering HEAD-then-GET probing, transfer-mode selection, and
//! the two transfer shapes (full-body and chunked).

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::events::{Event, EventBus};
use crate::fetch::{FetchClient, FetchError};
use crate::model::RegistryEntry;
use crate::store::Store;

use super::{mirror_status_with_total, percent_of};

/// Transfers at or above this size, when the server advertises Range
/// support, use the chunked path: a sequence of discrete Range requests
/// with progress persisted after every one, rather than a single
/// open-ended GET.
pub(crate) const CHUNKED_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

/// Size of each Range request issued by the chunked path.
pub(crate) const CHUNK_SIZE_BYTES: u64 = 2 * 1024 * 1024;

/// Outcome of a single fetch attempt.
pub(crate) enum AttemptOutcome {
    /// The transfer completed; `data` is the full payload, including
    /// whatever prefix was already held from a prior attempt.
    Success {
        data: Vec<u8>,
        total_bytes: Option<u64>,
        mime_type: Option<String>,
    },
    /// The caller cancelled the attempt (explicit abort, `stop`, or an
    /// offline edge). Not a failure: no retry budget is consumed. `data`
    /// is everything accumulated so far (prior prefix plus whatever
    /// landed this attempt), for the caller to persist as the new
    /// resumption point.
    Cancelled { data: Vec<u8> },
    /// A transient failure; the caller should retry, budget permitting.
    Retryable { message: String, retry_after_secs: Option<u64> },
    /// A failure the caller should not retry: the URL itself is
    /// malformed, so no amount of retrying will help.
    Permanent { message: String },
}

/// Executes one fetch attempt for `registry`, starting from
/// `existing_data` bytes already held (empty for a fresh attempt; its
/// length is the resumption offset). `known_total_bytes` is the size
/// last reconciled from a HEAD/GET probe, carried across attempts by the
/// caller so a resumed transfer can pick chunked mode back up without a
/// fresh probe (the probe is skipped entirely once the resumption offset
/// is nonzero; Range support is assumed to still hold).
///
/// Progress in the chunked path is persisted to `store` and emitted on
/// `events` after every chunk lands, so a crash mid-transfer loses at
/// most one chunk's worth of work. The full-body path only emits: a
/// crash partway through a small transfer just restarts it.
#[instrument(skip(fetch, store, events, cancel, existing_data), fields(id = %registry.id, resume_offset = existing_data.len()))]
pub(crate) async fn run_attempt(
    registry: &RegistryEntry,
    existing_data: Vec<u8>,
    known_total_bytes: Option<u64>,
    fetch: &dyn FetchClient,
    store: &dyn Store,
    events: &EventBus,
    cancel: &CancellationToken,
) -> AttemptOutcome {
    let resume_offset = existing_data.len() as u64;

    let (supports_range, probed_total, probed_mime, probed_encoding) = if resume_offset == 0 {
        match fetch.head(&registry.download_url).await {
            Ok(info) => (info.accepts_ranges, info.content_length, info.content_type, info.content_encoding),
            Err(_) => (false, None, None, None),
        }
    } else {
        (true, known_total_bytes, None, None)
    };

    // A compressed transfer's advertised length describes the
    // on-the-wire size, not the decoded payload, so it can't be trusted
    // as the transfer's total size.
    let is_compressed = probed_encoding
        .as_deref()
        .is_some_and(|encoding| !encoding.eq_ignore_ascii_case("identity"));
    let total_bytes = if is_compressed { None } else { probed_total };

    let use_chunked = supports_range && total_bytes.is_some_and(|total| total > CHUNKED_THRESHOLD_BYTES);
    debug!(use_chunked, ?total_bytes, "starting fetch attempt");

    if use_chunked {
        run_chunked(
            registry,
            existing_data,
            total_bytes.expect("use_chunked implies total_bytes is Some"),
            probed_mime,
            fetch,
            store,
            events,
            cancel,
        )
        .await
    } else {
        run_full_body(registry, existing_data, resume_offset, probed_total, probed_mime, fetch, events, cancel).await
    }
}

/// Sequential Range requests of [`CHUNK_SIZE_BYTES`] each, persisting
/// `byte_offset`/`bytes_downloaded` after every chunk lands.
#[allow(clippy::too_many_arguments)]
async fn run_chunked(
    registry: &RegistryEntry,
    existing_data: Vec<u8>,
    total_bytes: u64,
    probed_mime: Option<String>,
    fetch: &dyn FetchClient,
    store: &dyn Store,
    events: &EventBus,
    cancel: &CancellationToken,
) -> AttemptOutcome {
    let mut buffer = BytesMut::from(existing_data.as_slice());
    let mut downloaded = existing_data.len() as u64;
    let mut mime_type = registry.mime_type.clone().or(probed_mime);

    while downloaded < total_bytes {
        let chunk_start = downloaded;
        let chunk_end = (chunk_start + CHUNK_SIZE_BYTES - 1).min(total_bytes - 1);

        let body = match fetch.get(&registry.download_url, Some(chunk_start), Some(chunk_end)).await {
            Ok(body) => body,
            Err(err) => return classify_fetch_error(err),
        };
        mime_type = mime_type.or_else(|| body.content_type.clone());

        let mut stream = body.stream;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return AttemptOutcome::Cancelled { data: buffer.to_vec() };
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            downloaded += bytes.len() as u64;
                            buffer.extend_from_slice(&bytes);
                        }
                        Some(Err(err)) => return classify_fetch_error(err),
                        None => break,
                    }
                }
            }
        }

        if let Err(err) = super::persist_chunk_progress(store, events, &registry.id, downloaded, Some(total_bytes)).await {
            warn!(error = %err, id = %registry.id, "failed to persist chunk progress; continuing in-memory");
        }
    }

    AttemptOutcome::Success {
        data: buffer.to_vec(),
        total_bytes: Some(total_bytes),
        mime_type,
    }
}

/// A single open-ended GET, streamed straight into memory. Used for
/// transfers under the chunked threshold, and for any transfer whose
/// server doesn't advertise Range support.
#[allow(clippy::too_many_arguments)]
async fn run_full_body(
    registry: &RegistryEntry,
    existing_data: Vec<u8>,
    resume_offset: u64,
    probed_total: Option<u64>,
    probed_mime: Option<String>,
    fetch: &dyn FetchClient,
    events: &EventBus,
    cancel: &CancellationToken,
) -> AttemptOutcome {
    let range_start = if resume_offset > 0 { Some(resume_offset) } else { None };

    let body = match fetch.get(&registry.download_url, range_start, None).await {
        Ok(body) => body,
        Err(err) => return classify_fetch_error(err),
    };

    let is_compressed = body
        .content_encoding
        .as_deref()
        .is_some_and(|encoding| !encoding.eq_ignore_ascii_case("identity"));

    let total_bytes = if is_compressed {
        None
    } else {
        body.content_length.or(probed_total).map(|len| len + resume_offset)
    };

    let mime_type = registry
        .mime_type
        .clone()
        .or(probed_mime)
        .or_else(|| body.content_type.clone());

    let mut stream = body.stream;
    let mut buffer = BytesMut::from(existing_data.as_slice());
    let mut since_last_tick = 0u64;
    let mut downloaded = resume_offset;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return AttemptOutcome::Cancelled { data: buffer.to_vec() };
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        downloaded += bytes.len() as u64;
                        since_last_tick += bytes.len() as u64;
                        buffer.extend_from_slice(&bytes);

                        if since_last_tick >= CHUNK_SIZE_BYTES {
                            events.emit(Event::Progress {
                                id: registry.id.clone(),
                                bytes_downloaded: downloaded,
                                total_bytes,
                                percent: percent_of(downloaded, total_bytes),
                            });
                            since_last_tick = 0;
                        }
                    }
                    Some(Err(err)) => return classify_fetch_error(err),
                    None => break,
                }
            }
        }
    }

    AttemptOutcome::Success {
        data: buffer.to_vec(),
        total_bytes: total_bytes.or(Some(downloaded)),
        mime_type,
    }
}

fn classify_fetch_error(err: FetchError) -> AttemptOutcome {
    match err {
        FetchError::HttpStatus { status, retry_after, .. } => AttemptOutcome::Retryable {
            message: format!("server returned {status}"),
            retry_after_secs: retry_after,
        },
        FetchError::InvalidUrl { url } => AttemptOutcome::Permanent {
            message: format!("invalid url: {url}"),
        },
        FetchError::Timeout { url } => AttemptOutcome::Retryable {
            message: format!("timed out fetching {url}"),
            retry_after_secs: None,
        },
        FetchError::Network { url, source } => AttemptOutcome::Retryable {
            message: format!("network error fetching {url}: {source}"),
            retry_after_secs: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_errors_are_always_retryable() {
        for status in [404, 410, 500, 429, 403, 200] {
            let outcome = classify_fetch_error(FetchError::HttpStatus {
                url: "https://example.invalid/a".to_string(),
                status,
                retry_after: None,
            });
            assert!(matches!(outcome, AttemptOutcome::Retryable { .. }), "status {status} should be retryable");
        }
    }

    #[test]
    fn invalid_url_is_permanent() {
        let outcome = classify_fetch_error(FetchError::InvalidUrl {
            url: "not a url".to_string(),
        });
        assert!(matches!(outcome, AttemptOutcome::Permanent { .. }));
    }

    #[test]
    fn timeout_and_network_errors_are_retryable() {
        assert!(matches!(
            classify_fetch_error(FetchError::Timeout {
                url: "https://example.invalid/a".to_string()
            }),
            AttemptOutcome::Retryable { .. }
        ));
    }
}

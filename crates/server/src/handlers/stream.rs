//! Byte-range streaming of file content.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{ActiveStreamGuard, MetricsObserver};
use crate::services::bots::BotOp;
use crate::state::AppState;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use md5::{Digest, Md5};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::sync::Arc;
use teldrive_core::{Cipher, File};
use teldrive_stream::{ChunkSource, PartChunkSource, PartSpec, ReaderOptions, read_range};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// RFC 5987 attr-char complement.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub download: Option<String>,
}

impl StreamQuery {
    pub fn is_download(&self) -> bool {
        matches!(self.download.as_deref(), Some("1" | "true"))
    }
}

/// Parse a `Range` header against a file of `size` bytes.
///
/// Returns the inclusive window, or `None` when there is no header.
/// Multi-range and unsatisfiable ranges are 416; malformed headers are 400.
pub fn parse_range(value: Option<&str>, size: u64) -> ApiResult<Option<(u64, u64)>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| ApiError::InvalidRequest(format!("unsupported range {value:?}")))?;
    if spec.contains(',') {
        return Err(ApiError::RangeNotSatisfiable { size });
    }
    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| ApiError::InvalidRequest(format!("malformed range {value:?}")))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| ApiError::InvalidRequest(format!("malformed range {value:?}")))
    };

    let (start, end) = match (first.trim().is_empty(), last.trim().is_empty()) {
        (true, true) => {
            return Err(ApiError::InvalidRequest(format!("malformed range {value:?}")));
        }
        // Suffix: the last N bytes.
        (true, false) => {
            let n = parse(last)?;
            if n == 0 || size == 0 {
                return Err(ApiError::RangeNotSatisfiable { size });
            }
            (size.saturating_sub(n), size - 1)
        }
        (false, true) => (parse(first)?, size.saturating_sub(1)),
        (false, false) => {
            let (start, end) = (parse(first)?, parse(last)?);
            if end < start {
                return Err(ApiError::RangeNotSatisfiable { size });
            }
            (start, end.min(size.saturating_sub(1)))
        }
    };
    if start >= size {
        return Err(ApiError::RangeNotSatisfiable { size });
    }
    Ok(Some((start, end)))
}

/// Strong ETag: md5 over the file id and size.
pub fn etag(file: &File) -> String {
    let digest = Md5::digest(format!("{}{}", file.id, file.size_bytes()).as_bytes());
    format!("\"{}\"", hex::encode(digest))
}

pub fn http_date(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// `inline` or `attachment` with an ASCII fallback and an RFC 5987 name.
pub fn content_disposition(name: &str, download: bool) -> String {
    let kind = if download { "attachment" } else { "inline" };
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(name, FILENAME_ESCAPE);
    format!("{kind}; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

fn not_modified(file: &File, headers: &HeaderMap, etag: &str) -> bool {
    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return value
            .split(',')
            .map(str::trim)
            .any(|tag| tag == "*" || tag == etag || tag.strip_prefix("W/") == Some(etag));
    }
    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| file.updated_at.replace_nanosecond(0).unwrap_or(file.updated_at) <= since)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ApiError::Internal(format!("invalid header value: {e}")))
}

/// Resolve the reader's part list: stored sizes and, for encrypted files,
/// one cipher per part.
async fn part_specs(
    state: &AppState,
    file: &File,
    session: Option<&str>,
) -> ApiResult<Vec<PartSpec>> {
    let channel_id = file
        .channel_id
        .ok_or_else(|| ApiError::Internal(format!("file {} has no channel", file.id)))?;
    let client = state
        .client_for(file.user_id, session, BotOp::Stream, channel_id)
        .await?;

    let ciphers: Vec<Option<Cipher>> = if file.encrypted {
        let passphrase = state.config.uploads.encryption_key.clone().ok_or_else(|| {
            ApiError::Internal("encrypted file but no encryption key configured".to_string())
        })?;
        let salts: Vec<String> = file
            .parts
            .iter()
            .map(|p| p.salt.clone().unwrap_or_default())
            .collect();
        tokio::task::spawn_blocking(move || {
            salts
                .iter()
                .map(|salt| Cipher::new(&passphrase, salt).map(Some))
                .collect::<teldrive_core::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| ApiError::Internal(format!("key derivation task failed: {e}")))??
    } else {
        vec![None; file.parts.len()]
    };

    let mut specs = Vec::with_capacity(file.parts.len());
    for (part, cipher) in file.parts.iter().zip(ciphers) {
        let source = Arc::new(PartChunkSource::new(
            Arc::clone(&client),
            Arc::clone(&state.cache),
            file.id,
            channel_id,
            part.id,
        ));
        let stored_size = source.size().await?;
        specs.push(PartSpec {
            part_id: part.id,
            source: source as Arc<dyn ChunkSource>,
            stored_size,
            cipher,
        });
    }
    Ok(specs)
}

/// Answer a `HEAD` or `GET` for a file's content.
///
/// `session` is the caller's own upstream session; without it the owner's
/// newest stored session is used when the channel has no bots.
pub async fn serve_file(
    state: &AppState,
    file: &File,
    session: Option<&str>,
    method: &Method,
    headers: &HeaderMap,
    download: bool,
) -> ApiResult<Response> {
    if file.is_folder() {
        return Err(ApiError::InvalidRequest("folders cannot be streamed".to_string()));
    }
    let size = file.size_bytes();
    let etag = etag(file);

    let mut response = Response::new(Body::empty());
    {
        let h = response.headers_mut();
        h.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        h.insert(header::ETAG, header_value(&etag)?);
        h.insert(header::LAST_MODIFIED, header_value(&http_date(file.updated_at))?);
        h.insert(header::CONTENT_TYPE, header_value(&file.mime_type)?);
        h.insert(
            header::CONTENT_DISPOSITION,
            header_value(&content_disposition(&file.name, download))?,
        );
    }

    if not_modified(file, headers, &etag) {
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response.headers_mut().remove(header::CONTENT_TYPE);
        response.headers_mut().remove(header::CONTENT_DISPOSITION);
        return Ok(response);
    }

    if size == 0 {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        return Ok(response);
    }

    let range = parse_range(
        headers.get(header::RANGE).and_then(|v| v.to_str().ok()),
        size,
    )?;
    let (start, end) = range.unwrap_or((0, size - 1));
    let length = end - start + 1;
    if range.is_some() {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        response.headers_mut().insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{size}"))?,
        );
    }
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);

    if method == Method::HEAD {
        return Ok(response);
    }

    let parts = part_specs(state, file, session).await?;
    let cancel = CancellationToken::new();
    let options = ReaderOptions {
        workers: state.config.stream.multi_threads,
        buffers: state.config.stream.buffers,
        chunk_timeout: state.config.stream.chunk_timeout(),
        cancel: cancel.clone(),
        observer: Arc::new(MetricsObserver),
    };
    let mut reader = read_range(parts, start, end, options)?;

    let file_id = file.id;
    let guard = ActiveStreamGuard::new();
    let cancel_on_drop = cancel.drop_guard();
    let body = async_stream::stream! {
        let _guard = guard;
        let _cancel = cancel_on_drop;
        while let Some(item) = reader.next().await {
            match item {
                Ok(chunk) => yield Ok::<Bytes, std::io::Error>(chunk),
                Err(e) => {
                    tracing::warn!(file_id = %file_id, error = %e, code = e.code(), "stream failed mid-body");
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
    };
    *response.body_mut() = Body::from_stream(body);
    tracing::debug!(file_id = %file.id, start, end, "streaming file");
    Ok(response.into_response())
}

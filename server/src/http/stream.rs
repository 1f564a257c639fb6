use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http::{
    header::{
        ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
        RETRY_AFTER,
    },
    HeaderMap, HeaderValue, Method,
};
use tracing::{debug, instrument, warn};

use crate::http::{
    range::{parse_range, ParsedRange},
    svc::HttpEndpoint,
    AppError,
};
use api::{ChannelId, MsgId};

// stream endpoint
//
// this is the core read path through which all media access happens: look
// up the archived record, negotiate the byte range against its
// authoritative size, and only then open the upstream blob sequence.  the
// range logic is what lets browsers seek without buffering the whole file.
#[instrument(skip_all)]
pub(super) async fn stream_file(
    method: Method,
    headers: HeaderMap,
    State(state): State<Arc<HttpEndpoint>>,
    Path((channel_id, msg_id)): Path<(ChannelId, MsgId)>,
) -> Result<Response, AppError> {
    debug!({ channel_id, msg_id }, "serving stream request");

    // the upstream takes a few seconds to authenticate at boot; until then
    // honest unavailability beats a hung request
    if !state.upstream.connected() {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            [(RETRY_AFTER, HeaderValue::from_static("5"))],
        )
            .into_response());
    }

    // soft-deleted records are hidden from this endpoint as well as the
    // catalog; the archived message itself still exists
    let file = match state.get_file(channel_id, msg_id).await? {
        Some(file) if file.is_active => file,
        _ => return Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let total = file.size_bytes;

    let range_header = match headers.get(RANGE) {
        None => None,
        Some(val) => Some(val.to_str()?),
    };

    // a zero-length entry still answers a plain GET; any range against it
    // is unsatisfiable
    if total == 0 && range_header.is_none() {
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        resp_headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
        return Ok((StatusCode::OK, resp_headers, Body::empty()).into_response());
    }

    // range header check
    //
    // seeking, pause/resume, and everything else players do works by
    // sending a byte range which we echo back with a verification header
    let span = match parse_range(&state.range_regex, range_header, total) {
        Ok(span) => span,
        Err(unsat) => {
            debug!({ range = ?range_header }, "unsatisfiable range");
            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{}", unsat.total))?,
            );
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
        }
    };

    let (code, span) = match span {
        ParsedRange::Full(span) => (StatusCode::OK, span),
        ParsedRange::Partial(span) => (StatusCode::PARTIAL_CONTENT, span),
    };

    // response headers; modern browsers need all of these to be correct
    // before they will seek
    let mut resp_headers = HeaderMap::new();

    resp_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    resp_headers.insert(CONTENT_LENGTH, HeaderValue::from(span.want()));

    if code == StatusCode::PARTIAL_CONTENT {
        resp_headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", span.start, span.end, total))?,
        );
    }

    match HeaderValue::from_str(&file.mime_type) {
        Ok(mime) => {
            resp_headers.insert(CONTENT_TYPE, mime);
        }
        Err(_) => {
            warn!({ mime = %file.mime_type }, "unusable mime type in record");
            resp_headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }
    }

    resp_headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "inline; filename=\"{}\"",
            sanitize_filename(&file.display_name)
        ))?,
    );

    // HEAD must produce identical headers without opening an upstream
    // stream
    if method == Method::HEAD {
        return Ok((code, resp_headers, Body::empty()).into_response());
    }

    let body = Body::from_stream(state.engine.stream(channel_id, msg_id, span));

    Ok((code, resp_headers, body).into_response())
}

// quotes and control bytes would corrupt the Content-Disposition header;
// everything else in a display name is the uploader's business
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::sanitize_filename;

    #[test]
    fn filenames_lose_quotes_and_control_bytes() {
        assert_eq!(sanitize_filename("movie (1080p).mkv"), "movie (1080p).mkv");
        assert_eq!(sanitize_filename("a\"b\\c\nd.mp4"), "abcd.mp4");
        assert_eq!(sanitize_filename("\"\""), "file");
    }
}

//! Carrying request ids from a profiled response to whoever renders it.
//!
//! A normal response names its profile in a header, which an ajax caller
//! can read straight off the transport. A redirect can't do that: the
//! browser drops the headers when it follows the `Location`, so the ids go
//! into the redirect target's query string instead. Each hop of a redirect
//! sequence appends its own id, and the landing page ends up holding the
//! whole chain in causal order.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;

use crate::id::RequestId;

/// Query parameter carrying the redirect chain ("mini profiler redirect id").
pub const REDIRECT_PARAM: &str = "mp-r-id";
/// Id of the profile for this response.
pub const ID_HEADER: &str = "x-miniprofiler-id";
/// Every id leading up to and including this response, comma separated.
pub const CHAIN_HEADER: &str = "x-miniprofiler-ids";
/// Query string of the request, so ajax callers can tell which chain
/// parameter they sent.
pub const QUERY_STRING_HEADER: &str = "x-miniprofiler-qs";
/// Longest chain kept; older hops fall off the front.
///
/// A redirect sequence longer than this loses its first records from the
/// chain. They are still stored under their own ids. Truncation is logged
/// at debug level.
pub const MAX_CHAIN: usize = 32;

/// How a response carries its ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// In the redirect target's query string.
    Redirect { location: String },
    /// In response headers.
    Direct,
}

impl ResponseKind {
    pub fn of(response: &Response) -> Self {
        let redirect_status = matches!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok());
        match location {
            Some(location) if redirect_status => ResponseKind::Redirect {
                location: location.to_owned(),
            },
            _ => ResponseKind::Direct,
        }
    }
}

/// Ids the current request arrived with, oldest first.
///
/// A missing, empty or garbled parameter is an empty chain.
pub fn extract_chain_ids(query: Option<&str>) -> Vec<RequestId> {
    let Some(raw) = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| match pair.split_once('=') {
            Some((name, value)) if name == REDIRECT_PARAM => Some(value),
            _ => None,
        })
    else {
        return Vec::new();
    };

    let decoded = raw.replace("%2C", ",").replace("%2c", ",");
    let mut chain: Vec<RequestId> = Vec::new();
    for token in decoded.split(',').filter(|t| !t.is_empty()) {
        let Some(id) = RequestId::parse(token) else {
            return Vec::new();
        };
        if !chain.contains(&id) {
            chain.push(id);
        }
    }
    truncate(&mut chain);
    chain
}

/// The incoming chain followed by the current request's id.
pub fn chain_with(mut incoming: Vec<RequestId>, current: RequestId) -> Vec<RequestId> {
    incoming.retain(|id| *id != current);
    incoming.push(current);
    truncate(&mut incoming);
    incoming
}

fn truncate(chain: &mut Vec<RequestId>) {
    if chain.len() > MAX_CHAIN {
        let dropped = chain.len() - MAX_CHAIN;
        tracing::debug!(dropped, oldest = %chain[0], "redirect chain too long, dropping oldest hops");
        chain.drain(..dropped);
    }
}

pub fn join(chain: &[RequestId]) -> String {
    chain
        .iter()
        .map(RequestId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Attach `chain` (whose last id is the current request) to `response`.
/// `query` is the request's own query string.
///
/// Returns the rewritten location when the response is a redirect.
pub fn annotate(
    response: &mut Response,
    chain: &[RequestId],
    query: Option<&str>,
) -> Option<String> {
    let current = chain.last()?;
    let joined = join(chain);
    match ResponseKind::of(response) {
        ResponseKind::Redirect { location } => {
            let rewritten = with_chain_param(&location, &joined);
            let value = HeaderValue::from_str(&rewritten).ok()?;
            response.headers_mut().insert(header::LOCATION, value);
            Some(rewritten)
        }
        ResponseKind::Direct => {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(current.as_str()) {
                headers.insert(ID_HEADER, value);
            }
            if let Ok(value) = HeaderValue::from_str(&joined) {
                headers.insert(CHAIN_HEADER, value);
            }
            if let Some(Ok(value)) = query.filter(|q| !q.is_empty()).map(HeaderValue::from_str) {
                headers.insert(QUERY_STRING_HEADER, value);
            }
            None
        }
    }
}

/// `location` with any existing chain parameter replaced by `chain`.
/// Path, other parameters and fragment are kept as they were.
pub fn with_chain_param(location: &str, chain: &str) -> String {
    let (rest, fragment) = match location.find('#') {
        Some(i) => location.split_at(i),
        None => (location, ""),
    };
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| p.split('=').next() != Some(REDIRECT_PARAM))
        .collect();
    let ours = format!("{REDIRECT_PARAM}={chain}");
    params.push(&ours);

    format!("{path}?{}{fragment}", params.join("&"))
}

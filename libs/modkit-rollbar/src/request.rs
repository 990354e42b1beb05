//! Request snapshots.
//!
//! An inbound request body can only be read once. [`duplicate_request`] splits
//! one request into two whose [`ClonedBody`] halves are both fed by a single
//! read of the original stream; [`RequestContext`] turns one half into a
//! [`RequestSnapshot`] at most once and hands the same result to every item
//! built from it.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use http::header::{CONTENT_TYPE, HOST, HeaderMap};
use http::{Method, Request, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use tokio::sync::OnceCell;

use crate::body::decode;
use crate::error::RollbarError;
use crate::payload::RequestSnapshot;

/// Header the client address is read from
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Header the original scheme is read from for origin-form request URIs
pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

type SharedBytes = Shared<BoxFuture<'static, Result<Bytes, RollbarError>>>;

/// One copy of a duplicated request body.
///
/// All copies share one read of the original body; each copy yields the full
/// buffered content as a single frame. Cloning gives a fresh, unread copy.
pub struct ClonedBody {
    source: SharedBytes,
    done: bool,
}

impl ClonedBody {
    fn new(source: SharedBytes) -> Self {
        Self {
            source,
            done: false,
        }
    }
}

impl Clone for ClonedBody {
    fn clone(&self) -> Self {
        Self::new(self.source.clone())
    }
}

impl std::fmt::Debug for ClonedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonedBody")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Body for ClonedBody {
    type Data = Bytes;
    type Error = RollbarError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.source).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                match result {
                    Ok(bytes) if bytes.is_empty() => Poll::Ready(None),
                    Ok(bytes) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        match self.source.peek() {
            Some(Ok(bytes)) if !self.done => SizeHint::with_exact(bytes.len() as u64),
            Some(_) => SizeHint::with_exact(0),
            None => SizeHint::default(),
        }
    }
}

/// Split `request` into two requests with identical heads and bodies.
///
/// The original body is read at most once, on first poll of either copy.
#[must_use]
pub fn duplicate_request<B>(request: Request<B>) -> (Request<ClonedBody>, Request<ClonedBody>)
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = request.into_parts();

    let source = async move {
        body.collect()
            .await
            .map(http_body_util::Collected::to_bytes)
            .map_err(RollbarError::body_read)
    }
    .boxed()
    .shared();

    let mut copy = Request::new(ClonedBody::new(source.clone()));
    *copy.method_mut() = parts.method.clone();
    *copy.uri_mut() = parts.uri.clone();
    *copy.version_mut() = parts.version;
    *copy.headers_mut() = parts.headers.clone();
    *copy.extensions_mut() = parts.extensions.clone();

    (Request::from_parts(parts, ClonedBody::new(source)), copy)
}

/// Snapshot of one request, computed at most once.
///
/// Concurrent callers of [`snapshot`](Self::snapshot) wait on the same
/// computation; a failed decode is cached as well, so the body is never
/// decoded twice.
pub struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: ClonedBody,
    snapshot: OnceCell<Result<Arc<RequestSnapshot>, RollbarError>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("snapshot_ready", &self.snapshot.initialized())
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Capture `request`, returning the context and the application's copy.
    ///
    /// Must be called before anything else reads the body.
    #[must_use]
    pub fn capture<B>(request: Request<B>) -> (Self, Request<ClonedBody>)
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (ours, theirs) = duplicate_request(request);
        let (parts, body) = ours.into_parts();
        let context = Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            snapshot: OnceCell::new(),
        };
        (context, theirs)
    }

    /// The request snapshot, computing it on first use.
    ///
    /// # Errors
    ///
    /// Returns the (cached) error if the body could not be read or decoded.
    pub async fn snapshot(&self) -> Result<Arc<RequestSnapshot>, RollbarError> {
        self.snapshot
            .get_or_init(|| async {
                let mut request = Request::new(self.body.clone());
                *request.method_mut() = self.method.clone();
                *request.uri_mut() = self.uri.clone();
                *request.headers_mut() = self.headers.clone();

                match snapshot(request).await {
                    Ok(snapshot) => {
                        tracing::debug!(
                            method = %snapshot.method,
                            url = %snapshot.url,
                            "request snapshot computed"
                        );
                        Ok(Arc::new(snapshot))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to snapshot request");
                        Err(e)
                    }
                }
            })
            .await
            .clone()
    }
}

/// Read and decode `request` into a JSON-safe snapshot.
///
/// Consumes the body. `params` is always empty; routing happens elsewhere.
///
/// # Errors
///
/// Returns [`RollbarError::BodyRead`] if the body stream fails, or a decode
/// error from [`decode`].
pub async fn snapshot<B>(request: Request<B>) -> Result<RequestSnapshot, RollbarError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = request.into_parts();
    let raw = body
        .collect()
        .await
        .map_err(RollbarError::body_read)?
        .to_bytes();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let (text, object) = decode(raw, content_type).await?.into_parts();

    let query = parts.uri.query();

    Ok(RequestSnapshot {
        url: request_url(&parts.uri, &parts.headers),
        method: parts.method.to_string(),
        headers: header_map(&parts.headers),
        params: BTreeMap::new(),
        get: query_params(query),
        query_string: query_string(query),
        post: object,
        body: text,
        user_ip: forwarded_for(&parts.headers),
    })
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    map
}

fn query_params(query: Option<&str>) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

fn query_string(query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("?{q}"),
        _ => String::new(),
    }
}

/// Absolute URL of the request.
///
/// Server-side requests usually carry only path and query; scheme and host
/// then come from `x-forwarded-proto` (default `http`) and `Host`.
fn request_url(uri: &Uri, headers: &HeaderMap) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }

    let Some(host) = header_str(headers, HOST.as_str()) else {
        return uri.to_string();
    };
    let scheme = header_str(headers, FORWARDED_PROTO_HEADER)
        .and_then(|proto| proto.split(',').next())
        .map(str::trim)
        .filter(|proto| !proto.is_empty())
        .unwrap_or("http");
    let path = uri.path_and_query().map_or("/", http::uri::PathAndQuery::as_str);

    format!("{scheme}://{host}{path}")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .filter(|value| !value.is_empty())
}

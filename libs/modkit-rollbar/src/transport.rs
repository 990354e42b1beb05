//! Transport collaborator: how a serialized item reaches the collector.
//!
//! The client never picks a transport on its own. Callers pass one in,
//! either [`HyperTransport`] or their own [`Transport`] implementation
//! (closures can be adapted with [`from_fn`]).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::error::TransportError;

/// Request handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Collector acknowledgement
#[derive(Debug, Clone)]
pub struct TransportResponse {
    status: StatusCode,
    body: Bytes,
}

impl TransportResponse {
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// `true` for 2xx statuses
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Response body as text, lossy for invalid UTF-8
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request and returns the collector's answer.
///
/// A returned error and a non-success [`TransportResponse`] are both treated
/// as delivery failures by the client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`TransportError`] if no response was received.
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        (**self).send(request).await
    }
}

/// [`Transport`] backed by an async closure, see [`from_fn`]
#[derive(Clone)]
pub struct FnTransport<F>(F);

/// Adapt an async closure into a [`Transport`].
///
/// ```ignore
/// let transport = modkit_rollbar::from_fn(|request| async move {
///     Ok(TransportResponse::new(StatusCode::OK, ""))
/// });
/// ```
#[must_use]
pub fn from_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(OutboundRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send,
{
    FnTransport(f)
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(OutboundRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send,
{
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        (self.0)(request).await
    }
}

/// Pooled hyper client over rustls.
///
/// Uses webpki roots and accepts plain `http://` endpoints so local collectors
/// and mock servers work. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if the TLS connector cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| TransportError::Tls(Box::new(e)))?
            .https_or_http()
            .enable_all_versions()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .build(https);

        Ok(Self { client })
    }
}

/// Installed process-wide provider if any, otherwise aws-lc-rs
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|source| TransportError::InvalidUrl {
                url: request.url.clone(),
                source,
            })?;

        let mut outbound = Request::new(Full::new(request.body));
        *outbound.method_mut() = request.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = request.headers;

        let response = self.client.request(outbound).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        Ok(TransportResponse::new(status, body))
    }
}

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, TryFutureExt};
use http::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request};
use http_body::Body;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::builder::{build_payload, unstamped_payload};
use crate::config::RollbarConfig;
use crate::error::RollbarError;
use crate::item::LogItem;
use crate::payload::{Level, Payload, RequestSnapshot};
use crate::request::{ClonedBody, RequestContext};
use crate::transport::{OutboundRequest, Transport};

const APPLICATION_JSON: &str = "application/json";

/// Lowercase form of [`ACCESS_TOKEN_HEADER`](crate::config::ACCESS_TOKEN_HEADER)
const ACCESS_TOKEN_HEADER_NAME: &str = "x-rollbar-access-token";

type Outcome = Result<(), RollbarError>;
type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;
type SettledSlot = Arc<Mutex<Option<Outcome>>>;

struct Inner {
    config: RollbarConfig,
    transport: Arc<dyn Transport>,
}

/// In-flight deliveries keyed by id.
///
/// Delivered entries remove themselves; failed ones stay until
/// [`Rollbar::wait`] surfaces them.
#[derive(Default)]
struct PendingSet {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, SharedOutcome>>,
}

impl PendingSet {
    fn insert(&self, outcome: SharedOutcome) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, outcome);
        id
    }

    fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    fn current(&self) -> Vec<(u64, SharedOutcome)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, outcome)| (*id, outcome.clone()))
            .collect()
    }
}

/// Error reporting client.
///
/// `log` never blocks and never fails for delivery reasons: each item is
/// built, serialized and sent on its own task, exactly once. Failures are
/// observed through the returned [`DeliveryHandle`] or by [`wait`](Self::wait).
///
/// Clones share configuration, transport and the pending set. A reporter
/// created by [`with_request`](Self::with_request) shares configuration and
/// transport but tracks its own pending deliveries.
///
/// Delivery runs on the ambient tokio runtime; calling `log` outside of one
/// panics.
#[derive(Clone)]
pub struct Rollbar {
    inner: Arc<Inner>,
    request: Option<Arc<RequestContext>>,
    pending: Arc<PendingSet>,
}

impl std::fmt::Debug for Rollbar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollbar")
            .field("endpoint", &self.inner.config.endpoint)
            .field("environment", &self.inner.config.data.environment)
            .field("request", &self.request)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Rollbar {
    #[must_use]
    pub fn new(config: RollbarConfig, transport: impl Transport + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Arc::new(transport),
            }),
            request: None,
            pending: Arc::default(),
        }
    }

    /// Reporter scoped to one inbound request.
    ///
    /// The request is duplicated right away; the returned request is the
    /// application's copy and can be read independently of the snapshot
    /// attached to every item this reporter sends.
    #[must_use]
    pub fn with_request<B>(&self, request: Request<B>) -> (Self, Request<ClonedBody>)
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (context, request) = RequestContext::capture(request);
        let scoped = Self {
            inner: Arc::clone(&self.inner),
            request: Some(Arc::new(context)),
            pending: Arc::default(),
        };
        (scoped, request)
    }

    #[must_use]
    pub fn config(&self) -> &RollbarConfig {
        &self.inner.config
    }

    /// Log an untyped value such as a panic payload.
    ///
    /// # Errors
    ///
    /// Returns [`RollbarError::InvalidInput`] right away, without dispatching,
    /// if `value` is neither a string nor a boxed error.
    pub fn log_any(
        &self,
        value: Box<dyn Any + Send>,
        level: Level,
    ) -> Result<DeliveryHandle, RollbarError> {
        let item = LogItem::from_panic_payload(value)?;
        Ok(self.log(item, level))
    }

    /// Build the payload `item` would be sent with, minus level and timestamp.
    ///
    /// # Errors
    ///
    /// Returns the request snapshot error if the attached request body could
    /// not be decoded.
    pub async fn to_payload(&self, item: &LogItem) -> Result<Payload, RollbarError> {
        let request = self.request_snapshot().await?;
        Ok(unstamped_payload(
            &self.inner.config.data,
            item,
            request.as_deref(),
        ))
    }

    /// Number of deliveries still in flight or failed and not yet surfaced.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.entries.lock().len()
    }

    /// Wait for every delivery pending at the time of the call.
    ///
    /// Items logged after `wait` starts are not included. A delivery that has
    /// not settled keeps this future pending; there is no timeout.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed. That entry is discarded; other
    /// failed entries stay pending for the next call.
    pub async fn wait(&self) -> Result<(), RollbarError> {
        let joined = futures::future::try_join_all(
            self.pending
                .current()
                .into_iter()
                .map(|(id, outcome)| outcome.map_err(move |e| (id, e))),
        )
        .await;

        match joined {
            Ok(_) => Ok(()),
            Err((id, e)) => {
                self.pending.remove(id);
                Err(e)
            }
        }
    }

    async fn request_snapshot(&self) -> Result<Option<Arc<RequestSnapshot>>, RollbarError> {
        match &self.request {
            Some(context) => context.snapshot().await.map(Some),
            None => Ok(None),
        }
    }

    async fn deliver(&self, item: &LogItem, level: Level) -> Result<(), RollbarError> {
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let request = self.request_snapshot().await?;
        let payload = build_payload(
            &self.inner.config.data,
            item,
            request.as_deref(),
            level,
            timestamp,
        );
        let body = serde_json::to_vec(&payload).map_err(RollbarError::serialize)?;

        let response = self
            .inner
            .transport
            .send(OutboundRequest {
                url: self.inner.config.endpoint.clone(),
                method: Method::POST,
                headers: self.headers()?,
                body: body.into(),
            })
            .await?;

        if response.is_success() {
            Ok(())
        } else {
            Err(RollbarError::Rejected {
                status: response.status(),
                body: response.text(),
            })
        }
    }

    fn headers(&self) -> Result<HeaderMap, RollbarError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));

        if let Some(token) = &self.inner.config.access_token {
            let mut value = HeaderValue::from_str(token.expose())
                .map_err(|e| RollbarError::InvalidRequest(Arc::new(e)))?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(ACCESS_TOKEN_HEADER_NAME), value);
        }
        Ok(headers)
    }
}

// Handles may be dropped; delivery carries on regardless.
#[allow(clippy::must_use_candidate)]
impl Rollbar {
    /// Send `item` at `level` in the background.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn log(&self, item: impl Into<LogItem>, level: Level) -> DeliveryHandle {
        let item = item.into();
        let (tx, rx) = oneshot::channel::<Outcome>();
        let outcome = rx
            .map(|received| received.unwrap_or(Err(RollbarError::Aborted)))
            .boxed()
            .shared();
        let id = self.pending.insert(outcome.clone());
        let settled = SettledSlot::default();

        let reporter = self.clone();
        let slot = Arc::clone(&settled);
        tokio::spawn(async move {
            tracing::debug!(id, severity = %level, "dispatching item");
            let result = reporter.deliver(&item, level).await;
            // Written before the pending entry goes away.
            *slot.lock() = Some(result.clone());
            match &result {
                Ok(()) => {
                    reporter.pending.remove(id);
                    tracing::debug!(id, severity = %level, "item delivered");
                }
                Err(e) => {
                    tracing::warn!(id, severity = %level, error = %e, "failed to deliver item");
                }
            }
            if tx.send(result).is_err() {
                tracing::trace!(id, "delivery outcome has no observers");
            }
        });

        DeliveryHandle {
            id,
            outcome,
            settled,
        }
    }

    pub fn debug(&self, item: impl Into<LogItem>) -> DeliveryHandle {
        self.log(item, Level::Debug)
    }

    pub fn info(&self, item: impl Into<LogItem>) -> DeliveryHandle {
        self.log(item, Level::Info)
    }

    pub fn warning(&self, item: impl Into<LogItem>) -> DeliveryHandle {
        self.log(item, Level::Warning)
    }

    pub fn error(&self, item: impl Into<LogItem>) -> DeliveryHandle {
        self.log(item, Level::Error)
    }

    pub fn critical(&self, item: impl Into<LogItem>) -> DeliveryHandle {
        self.log(item, Level::Critical)
    }
}

/// Outcome of one `log` call.
///
/// Dropping the handle does not cancel delivery. Awaiting it yields the
/// delivery result; the entry stays in the reporter's pending set until
/// [`Rollbar::wait`] observes it.
#[derive(Clone)]
pub struct DeliveryHandle {
    id: u64,
    outcome: SharedOutcome,
    settled: SettledSlot,
}

impl DeliveryHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The settled outcome, or `None` while delivery is still running.
    ///
    /// Set by the delivery task itself; the handle does not need to be polled.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<(), RollbarError>> {
        self.settled.lock().clone()
    }
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("id", &self.id)
            .field("outcome", &*self.settled.lock())
            .finish_non_exhaustive()
    }
}

impl Future for DeliveryHandle {
    type Output = Result<(), RollbarError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome.poll_unpin(cx)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{ACCESS_TOKEN_HEADER, DEFAULT_ENDPOINT, DataTemplate};
    use crate::error::TransportError;
    use crate::transport::{TransportResponse, from_fn};
    use http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::time::Duration;

    type Sent = Arc<Mutex<Vec<OutboundRequest>>>;

    fn config() -> RollbarConfig {
        RollbarConfig::new(DataTemplate::new("test"))
    }

    /// Reporter whose transport records every request and answers `status`.
    fn recording(config: RollbarConfig, status: StatusCode) -> (Rollbar, Sent) {
        let sent: Sent = Arc::default();
        let recorder = Arc::clone(&sent);
        let transport = from_fn(move |request: OutboundRequest| {
            recorder.lock().push(request);
            async move { Ok(TransportResponse::new(status, r#"{"err":0}"#)) }
        });
        (Rollbar::new(config, transport), sent)
    }

    fn failing(message: &'static str) -> Rollbar {
        Rollbar::new(
            config(),
            from_fn(move |_| async move { Err(TransportError::Other(message.to_owned())) }),
        )
    }

    fn sent_json(sent: &Sent, index: usize) -> Value {
        serde_json::from_slice(&sent.lock()[index].body).unwrap()
    }

    #[tokio::test]
    async fn test_sends_json_post_with_token() {
        let (rollbar, sent) = recording(config().with_access_token("secret"), StatusCode::OK);

        rollbar.info("hello");
        rollbar.wait().await.unwrap();

        let request = sent.lock()[0].clone();
        assert_eq!(request.url, DEFAULT_ENDPOINT);
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.headers[ACCEPT], "application/json");
        assert_eq!(request.headers[ACCESS_TOKEN_HEADER], "secret");
        assert!(request.headers[ACCESS_TOKEN_HEADER].is_sensitive());

        let body = sent_json(&sent, 0);
        assert_eq!(body["data"]["body"], json!({ "message": { "body": "hello" } }));
        assert_eq!(body["data"]["level"], "info");
        assert_eq!(body["data"]["language"], "rust");
        assert_eq!(body["data"]["environment"], "test");
        assert!(body["data"]["timestamp"].as_i64().unwrap() > 1_600_000_000);
    }

    #[tokio::test]
    async fn test_token_header_omitted_without_token() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);

        rollbar.debug("no token").await.unwrap();

        assert!(sent.lock()[0].headers.get(ACCESS_TOKEN_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_delivered_items_leave_pending_set() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);

        let handles: Vec<_> = (0..3).map(|i| rollbar.warning(format!("item {i}"))).collect();
        assert_eq!(rollbar.pending_count(), 3);

        rollbar.wait().await.unwrap();
        assert_eq!(rollbar.pending_count(), 0);
        assert_eq!(sent.lock().len(), 3);
        for handle in handles {
            assert!(matches!(handle.outcome(), Some(Ok(()))));
        }
    }

    #[tokio::test]
    async fn test_outcome_settles_without_polling_handle() {
        let (rollbar, _) = recording(config(), StatusCode::OK);
        let failing = failing("offline");

        let delivered = rollbar.info("delivered");
        let rejected = failing.info("rejected");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(rollbar.pending_count(), 0);
        assert!(matches!(delivered.outcome(), Some(Ok(()))));
        assert!(format!("{delivered:?}").contains("Some(Ok(()))"));

        assert_eq!(failing.pending_count(), 1);
        assert!(matches!(
            rejected.outcome(),
            Some(Err(RollbarError::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn test_wait_surfaces_transport_failure_once() {
        let rollbar = failing("connection refused");

        rollbar.error("boom");
        let err = rollbar.wait().await.unwrap_err();
        assert!(matches!(err, RollbarError::Transport(_)));
        assert!(err.to_string().contains("connection refused"));

        assert_eq!(rollbar.pending_count(), 0);
        rollbar.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_items_stay_pending_until_waited() {
        let rollbar = failing("offline");

        let handle = rollbar.critical("boom");
        assert!(handle.clone().await.is_err());
        assert_eq!(rollbar.pending_count(), 1);

        assert!(rollbar.wait().await.is_err());
        assert_eq!(rollbar.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_warns_without_token() {
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = FieldVisitor(Vec::new());
                    event.record(&mut visitor);
                    self.warnings.lock().push(visitor.0.join(" "));
                }
            }
        }

        struct FieldVisitor(Vec<String>);
        impl tracing::field::Visit for FieldVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                self.0.push(format!("{}={value:?}", field.name()));
            }
        }

        let capture = WarningCapture::default();
        let warnings = Arc::clone(&capture.warnings);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture));

        let rollbar = Rollbar::new(
            config().with_access_token("top-secret"),
            from_fn(|_| async { Err(TransportError::Other("offline".to_owned())) }),
        );
        rollbar.error("boom");
        assert!(rollbar.wait().await.is_err());

        let warnings = warnings.lock();
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("failed to deliver item") && w.contains("offline")),
            "expected a delivery warning, got: {:?}",
            *warnings
        );
        assert!(warnings.iter().all(|w| !w.contains("top-secret")));
    }

    #[tokio::test]
    async fn test_rejected_delivery_carries_response_body() {
        let transport = from_fn(|_| async {
            Ok(TransportResponse::new(
                StatusCode::FORBIDDEN,
                r#"{"err":1,"message":"access token required"}"#,
            ))
        });
        let rollbar = Rollbar::new(config(), transport);

        let err = rollbar.error("boom").await.unwrap_err();
        let RollbarError::Rejected { status, .. } = &err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(*status, StatusCode::FORBIDDEN);
        assert_eq!(
            err.to_string(),
            r#"Failed to log to Rollbar: {"err":1,"message":"access token required"}"#
        );
    }

    #[tokio::test]
    async fn test_hung_transport_keeps_wait_pending() {
        let transport = from_fn(|_| {
            futures::future::pending::<Result<TransportResponse, TransportError>>()
        });
        let rollbar = Rollbar::new(config(), transport);

        let handle = rollbar.info("never acknowledged");
        let waited = tokio::time::timeout(Duration::from_millis(50), rollbar.wait()).await;

        assert!(waited.is_err(), "wait has no timeout of its own");
        assert!(handle.outcome().is_none());
        assert_eq!(rollbar.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_log_any_rejects_unsupported_values() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);

        let err = rollbar.log_any(Box::new(7_i64), Level::Error).unwrap_err();
        assert_eq!(err.to_string(), "must be string or error");
        assert_eq!(rollbar.pending_count(), 0);

        rollbar
            .log_any(Box::new("panicked"), Level::Critical)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(
            sent_json(&sent, 0)["data"]["body"]["message"]["body"],
            "panicked"
        );
        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_error_items_are_sent_as_traces() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);
        let err = "x".parse::<u32>().unwrap_err();

        rollbar.error(LogItem::error(&err)).await.unwrap();

        let trace = &sent_json(&sent, 0)["data"]["body"]["trace"];
        assert_eq!(trace["exception"]["class"], "ParseIntError");
        assert_eq!(trace["exception"]["message"], "invalid digit found in string");
        assert!(trace["frames"].is_array());
    }

    fn inbound(content_type: &str, body: &str) -> Request<String> {
        Request::builder()
            .method("POST")
            .uri("https://example.com/foo/bar?baz=qux")
            .header(CONTENT_TYPE, content_type)
            .body(body.to_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_scoped_reporter_attaches_request() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);
        let (scoped, app_request) =
            rollbar.with_request(inbound("application/x-www-form-urlencoded", "foo=bar"));

        scoped.error("first");
        scoped.error("second");
        scoped.wait().await.unwrap();

        for index in 0..2 {
            let request = &sent_json(&sent, index)["data"]["request"];
            assert_eq!(request["query_string"], "?baz=qux");
            assert_eq!(request["GET"], json!({ "baz": "qux" }));
            assert_eq!(request["POST"], json!({ "foo": "bar" }));
            assert!(request.get("body").is_none());
        }

        let app_body = app_request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&app_body[..], b"foo=bar");
        assert_eq!(rollbar.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_preview_is_repeatable() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);
        let (scoped, _app_request) = rollbar.with_request(inbound("text/plain", "Hello"));
        let item = LogItem::error(&"x".parse::<u8>().unwrap_err());

        let first = scoped.to_payload(&item).await.unwrap();
        let second = scoped.to_payload(&item).await.unwrap();

        assert_eq!(first, second);
        assert!(first.data.level.is_none());
        assert_eq!(
            first.data.request.as_ref().and_then(|r| r.body.as_deref()),
            Some("Hello")
        );
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_stays_with_its_reporter() {
        let (rollbar, sent) = recording(config(), StatusCode::OK);
        let (broken, _) = rollbar.with_request(inbound("application/json", "{not json"));
        let (healthy, _) = rollbar.with_request(inbound("application/json", r#"{"a":1}"#));

        broken.error("broken");
        healthy.error("healthy");

        let err = broken.wait().await.unwrap_err();
        assert!(matches!(err, RollbarError::InvalidJson(_)));
        healthy.wait().await.unwrap();

        assert_eq!(sent.lock().len(), 1);
        assert_eq!(sent_json(&sent, 0)["data"]["request"]["POST"], json!({ "a": 1 }));
    }
}

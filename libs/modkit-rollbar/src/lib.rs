#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Error reporting client for `ModKit`
//!
//! Sends messages and errors to a Rollbar-compatible item endpoint:
//! - Fire-and-forget [`Rollbar::log`] with per-item [`DeliveryHandle`]s
//! - [`Rollbar::wait`] to confirm everything in flight was delivered
//! - Request snapshots (headers, query, decoded body) attached to items,
//!   with the inbound body read exactly once
//! - JSON, urlencoded and multipart body decoding
//! - Injected transport; [`HyperTransport`] is the rustls-backed default
//!
//! # Example
//!
//! ```ignore
//! use modkit_rollbar::{DataTemplate, HyperTransport, LogItem, Rollbar, RollbarConfig};
//!
//! let config = RollbarConfig::new(DataTemplate::new("production"))
//!     .with_access_token(token);
//! let rollbar = Rollbar::new(config, HyperTransport::new()?);
//!
//! // per inbound request
//! let (reporter, request) = rollbar.with_request(request);
//! if let Err(e) = handle(request).await {
//!     reporter.error(LogItem::error(&e));
//! }
//! reporter.wait().await?;
//! ```

mod body;
mod builder;
mod client;
mod config;
mod error;
mod frames;
mod item;
mod payload;
mod request;
mod transport;

pub use body::{DecodedBody, decode, media_type};
pub use builder::{build_payload, unstamped_payload};
pub use client::{DeliveryHandle, Rollbar};
pub use config::{
    ACCESS_TOKEN_HEADER, AccessToken, DEFAULT_ENDPOINT, DEFAULT_LANGUAGE, DataTemplate, Notifier,
    Person, RollbarConfig, Server,
};
pub use error::{RollbarError, SharedSource, TransportError};
pub use frames::{UNKNOWN_FILE_NAME, capture_frames};
pub use item::{CapturedError, LogItem};
pub use payload::{
    Body, Data, Exception, Level, Message, Payload, RequestSnapshot, StackFrame, Trace,
};
pub use request::{
    ClonedBody, FORWARDED_FOR_HEADER, FORWARDED_PROTO_HEADER, RequestContext, duplicate_request,
    snapshot,
};
pub use transport::{
    FnTransport, HyperTransport, OutboundRequest, Transport, TransportResponse, from_fn,
};

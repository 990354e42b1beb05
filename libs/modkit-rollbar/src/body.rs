//! Content-type aware decoding of a buffered request body.

use axum::extract::{FromRequest, Multipart};
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::RollbarError;

/// Decoded request body: raw text or a parsed object, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedBody {
    Text(String),
    Object(Value),
}

impl DecodedBody {
    /// Split into the `(body, POST)` pair of the request snapshot.
    #[must_use]
    pub fn into_parts(self) -> (Option<String>, Option<Value>) {
        match self {
            DecodedBody::Text(text) => (Some(text), None),
            DecodedBody::Object(object) => (None, Some(object)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    UrlEncoded,
    Multipart,
    Text,
}

impl BodyKind {
    fn of(content_type: Option<&str>) -> Self {
        match content_type.and_then(media_type).as_deref() {
            Some("application/json") => BodyKind::Json,
            Some("application/x-www-form-urlencoded") => BodyKind::UrlEncoded,
            Some("multipart/form-data") => BodyKind::Multipart,
            _ => BodyKind::Text,
        }
    }
}

/// Primary media type of a `Content-Type` value.
///
/// Parameters (`charset`, `boundary`, ...) are dropped, the result is trimmed
/// and lowercased. Returns `None` for an empty value.
#[must_use]
pub fn media_type(content_type: &str) -> Option<String> {
    let primary = content_type
        .split_once(';')
        .map_or(content_type, |(primary, _)| primary)
        .trim();

    if primary.is_empty() {
        None
    } else {
        Some(primary.to_ascii_lowercase())
    }
}

/// Decode a fully buffered body according to its declared content type.
///
/// - `application/json`: parsed JSON value.
/// - `application/x-www-form-urlencoded`, `multipart/form-data`: object of
///   field name to text value. Multipart file parts are dropped.
/// - anything else, or no content type: the body as text.
///
/// `content_type` is the full header value; multipart needs its `boundary`.
///
/// # Errors
///
/// Returns [`RollbarError::InvalidJson`] for a malformed JSON body and
/// [`RollbarError::Form`] for a malformed form body.
pub async fn decode(raw: Bytes, content_type: Option<&str>) -> Result<DecodedBody, RollbarError> {
    match BodyKind::of(content_type) {
        BodyKind::Json => serde_json::from_slice(&raw)
            .map(DecodedBody::Object)
            .map_err(RollbarError::invalid_json),
        BodyKind::UrlEncoded => decode_urlencoded(&raw).map(DecodedBody::Object),
        BodyKind::Multipart => {
            let content_type = content_type.unwrap_or_default();
            decode_multipart(raw, content_type)
                .await
                .map(DecodedBody::Object)
        }
        BodyKind::Text => Ok(DecodedBody::Text(String::from_utf8_lossy(&raw).into_owned())),
    }
}

fn decode_urlencoded(raw: &[u8]) -> Result<Value, RollbarError> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(raw).map_err(|e| RollbarError::Form {
            reason: e.to_string(),
        })?;

    let mut fields = Map::new();
    for (name, value) in pairs {
        fields.insert(name, Value::String(value));
    }
    Ok(Value::Object(fields))
}

async fn decode_multipart(raw: Bytes, content_type: &str) -> Result<Value, RollbarError> {
    let request = http::Request::builder()
        .header(http::header::CONTENT_TYPE, content_type)
        .body(axum::body::Body::from(raw))?;

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| RollbarError::Form {
            reason: rejection.to_string(),
        })?;

    let mut fields = Map::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| form_error(&e))? {
        // File parts are not representable as text fields.
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let value = field.text().await.map_err(|e| form_error(&e))?;
        fields.insert(name, Value::String(value));
    }
    Ok(Value::Object(fields))
}

fn form_error(err: &axum::extract::multipart::MultipartError) -> RollbarError {
    RollbarError::Form {
        reason: err.to_string(),
    }
}

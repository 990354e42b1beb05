//! Assembly of wire payloads from the configured template and a log item.
//!
//! Building is a pure function of its inputs. Level and timestamp are passed
//! in rather than sampled, so two builds from the same inputs compare equal.

use crate::config::{DEFAULT_LANGUAGE, DataTemplate};
use crate::item::LogItem;
use crate::payload::{Body, Data, Level, Message, Payload, RequestSnapshot};

/// Build a payload without level or timestamp.
///
/// Template fields are copied as-is; `body` and `request` always come from
/// the arguments and `language` is always [`DEFAULT_LANGUAGE`].
#[must_use]
pub fn unstamped_payload(
    template: &DataTemplate,
    item: &LogItem,
    request: Option<&RequestSnapshot>,
) -> Payload {
    Payload {
        data: Data {
            environment: template.environment.clone(),
            body: body_of(item),
            level: None,
            timestamp: None,
            code_version: template.code_version.clone(),
            platform: template.platform.clone(),
            language: Some(DEFAULT_LANGUAGE.to_owned()),
            framework: template.framework.clone(),
            context: template.context.clone(),
            request: request.cloned(),
            person: template.person.clone(),
            server: template.server.clone(),
            custom: template.custom.clone(),
            fingerprint: template.fingerprint.clone(),
            title: template.title.clone(),
            uuid: template.uuid.clone(),
            notifier: template.notifier.clone(),
        },
    }
}

/// Build the payload sent for one log call.
#[must_use]
pub fn build_payload(
    template: &DataTemplate,
    item: &LogItem,
    request: Option<&RequestSnapshot>,
    level: Level,
    timestamp: i64,
) -> Payload {
    let mut payload = unstamped_payload(template, item, request);
    payload.data.level = Some(level);
    payload.data.timestamp = Some(timestamp);
    payload
}

fn body_of(item: &LogItem) -> Body {
    match item {
        LogItem::Message(text) => Body::Message(Message::new(text.clone())),
        LogItem::Error(err) => Body::Trace(err.to_trace()),
        LogItem::ErrorChain(chain) => {
            Body::TraceChain(chain.iter().map(crate::item::CapturedError::to_trace).collect())
        }
    }
}

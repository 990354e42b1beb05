use std::any::Any;
use std::error::Error;

use crate::error::RollbarError;
use crate::frames::capture_frames;
use crate::payload::{Exception, StackFrame, Trace};

/// An error captured for reporting: type name, message and stack.
///
/// Immutable once captured. The stack is taken where the error is captured,
/// not where it was created, since Rust errors do not carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    class: String,
    message: String,
    frames: Vec<StackFrame>,
}

impl CapturedError {
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            frames,
        }
    }

    /// Capture `err` together with the current stack.
    #[must_use]
    #[inline(never)]
    pub fn capture<E: Error + ?Sized>(err: &E) -> Self {
        Self::new(class_name(err), err.to_string(), capture_frames())
    }

    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub(crate) fn to_trace(&self) -> Trace {
        Trace {
            frames: self.frames.clone(),
            exception: Exception {
                class: self.class.clone(),
                message: Some(self.message.clone()),
                description: None,
            },
        }
    }
}

/// What gets reported: a plain message or an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogItem {
    Message(String),
    Error(CapturedError),
    /// The reported error followed by its `source()` chain
    ErrorChain(Vec<CapturedError>),
}

impl LogItem {
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        LogItem::Message(text.into())
    }

    /// Report `err` as a single trace.
    #[must_use]
    #[inline(never)]
    pub fn error<E: Error + ?Sized>(err: &E) -> Self {
        LogItem::Error(CapturedError::capture(err))
    }

    /// Report `err` and every error in its `source()` chain.
    ///
    /// Only the outermost error carries stack frames; causes are reported
    /// with their type and message.
    #[must_use]
    #[inline(never)]
    pub fn error_chain<E: Error + ?Sized>(err: &E) -> Self {
        let mut chain = vec![CapturedError::capture(err)];
        let mut cause = err.source();
        while let Some(current) = cause {
            chain.push(CapturedError::new(
                class_name(current),
                current.to_string(),
                Vec::new(),
            ));
            cause = current.source();
        }
        LogItem::ErrorChain(chain)
    }

    /// Convert a panic payload (as returned by `catch_unwind` or
    /// `JoinError::into_panic`).
    ///
    /// `String` and `&'static str` payloads become messages; a boxed error
    /// becomes an error item.
    ///
    /// # Errors
    ///
    /// Returns [`RollbarError::InvalidInput`] for any other payload type.
    pub fn from_panic_payload(payload: Box<dyn Any + Send>) -> Result<Self, RollbarError> {
        let payload = match payload.downcast::<String>() {
            Ok(text) => return Ok(LogItem::Message(*text)),
            Err(other) => other,
        };
        let payload = match payload.downcast::<&'static str>() {
            Ok(text) => return Ok(LogItem::Message((*text).to_owned())),
            Err(other) => other,
        };
        match payload.downcast::<Box<dyn Error + Send + Sync>>() {
            Ok(err) => Ok(LogItem::error(&**err)),
            Err(_) => Err(RollbarError::InvalidInput),
        }
    }
}

impl From<String> for LogItem {
    fn from(text: String) -> Self {
        LogItem::Message(text)
    }
}

impl From<&str> for LogItem {
    fn from(text: &str) -> Self {
        LogItem::Message(text.to_owned())
    }
}

impl From<CapturedError> for LogItem {
    fn from(err: CapturedError) -> Self {
        LogItem::Error(err)
    }
}

/// Short type name of an error value.
///
/// Uses the static type when it is known; for trait objects falls back to the
/// leading identifier of the `Debug` output, which is the type or variant name
/// for derived impls.
#[allow(clippy::use_debug)]
fn class_name<E: Error + ?Sized>(err: &E) -> String {
    let type_name = std::any::type_name::<E>();
    if !type_name.starts_with("dyn ") {
        return last_path_segment(type_name).to_owned();
    }

    let debug = format!("{err:?}");
    let ident: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    let ident = last_path_segment(&ident);
    if ident.is_empty() {
        "Error".to_owned()
    } else {
        ident.to_owned()
    }
}

fn last_path_segment(path: &str) -> &str {
    let without_generics = path.split_once('<').map_or(path, |(head, _)| head);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

//! Stack capture for error items.

use crate::payload::StackFrame;

/// Filename reported for frames without debug info
pub const UNKNOWN_FILE_NAME: &str = "unknown_file_name";

/// Functions that only exist to take the capture
const CAPTURE_FUNCTIONS: &[&str] = &[
    "frames::capture_frames",
    "item::CapturedError::capture",
    "item::LogItem::error",
];

/// Capture the caller's stack, oldest call first.
///
/// Frames belonging to the capture machinery itself (the unwinder, this
/// function and the error capture helpers) are skipped. Frames that cannot be symbolized are omitted.
#[must_use]
#[inline(never)]
pub fn capture_frames() -> Vec<StackFrame> {
    let mut frames = Vec::new();

    backtrace::trace(|frame| {
        backtrace::resolve_frame(frame, |symbol| {
            let Some(name) = symbol.name() else {
                return;
            };
            frames.push(StackFrame {
                filename: symbol.filename().map_or_else(
                    || UNKNOWN_FILE_NAME.to_owned(),
                    |path| path.display().to_string(),
                ),
                lineno: symbol.lineno(),
                colno: symbol.colno(),
                method: Some(format!("{name:#}")),
            });
        });
        true
    });

    // `frames` is innermost first here; drop everything up to and including
    // the outermost capture helper.
    let skip = frames
        .iter()
        .rposition(|frame| is_capture_frame(frame.method.as_deref()))
        .map_or(0, |idx| idx + 1);

    let mut frames = frames.split_off(skip);
    frames.reverse();
    frames
}

fn is_capture_frame(method: Option<&str>) -> bool {
    method.is_some_and(|m| CAPTURE_FUNCTIONS.iter().any(|f| m.contains(f)))
}

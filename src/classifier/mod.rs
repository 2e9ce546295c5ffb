//! Response classification.
//!
//! Pure checks over a completed [`ResponseEnvelope`] that surface
//! platform-level outcomes (automation blocking, duplicate submissions,
//! rate limiting, suspension) which arrive as ordinary HTTP responses.

use serde_json::Value;

use crate::request::executor::ResponseEnvelope;

/// Error codes the platform embeds in `errors[].code`.
pub struct PlatformCodes;

impl PlatformCodes {
    pub const AUTOMATION_BLOCKED: i64 = 226;
    pub const DUPLICATE_CONTENT: i64 = 187;
    pub const RATE_LIMITED: i64 = 88;
    pub const SUSPENDED: i64 = 64;
    pub const LOCKED: i64 = 326;
}

const TOO_MANY_REQUESTS: u16 = 429;

/// One entry of the platform error list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformError {
    pub code: Option<i64>,
    pub message: Option<String>,
}

impl PlatformError {
    fn from_value(value: &Value) -> Self {
        let code = value
            .get("code")
            .or_else(|| value.pointer("/extensions/code"))
            .and_then(code_from_value);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { code, message }
    }

    fn has_code(&self, code: i64) -> bool {
        self.code == Some(code)
    }
}

fn code_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// All four flags at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub bot_detected: bool,
    pub duplicate: bool,
    pub rate_limited: bool,
    pub suspended: bool,
}

/// Normalizes `{errors: [...]}` and `{errors: {...}}` into a list.
pub fn platform_errors(envelope: &ResponseEnvelope) -> Vec<PlatformError> {
    let Some(errors) = envelope.json().and_then(|body| body.get("errors")) else {
        return Vec::new();
    };
    match errors {
        Value::Array(items) => items.iter().map(PlatformError::from_value).collect(),
        Value::Object(_) => vec![PlatformError::from_value(errors)],
        _ => Vec::new(),
    }
}

pub fn is_bot_detected(envelope: &ResponseEnvelope) -> bool {
    i64::from(envelope.status()) == PlatformCodes::AUTOMATION_BLOCKED
        || platform_errors(envelope)
            .iter()
            .any(|error| error.has_code(PlatformCodes::AUTOMATION_BLOCKED))
}

/// Applies regardless of status: duplicates often come back as 200.
pub fn is_duplicate(envelope: &ResponseEnvelope) -> bool {
    platform_errors(envelope).iter().any(|error| {
        error.has_code(PlatformCodes::DUPLICATE_CONTENT)
            || error
                .message
                .as_deref()
                .is_some_and(|message| message.to_ascii_lowercase().contains("duplicate"))
    })
}

pub fn is_rate_limited(envelope: &ResponseEnvelope) -> bool {
    envelope.status() == TOO_MANY_REQUESTS
        || platform_errors(envelope)
            .iter()
            .any(|error| error.has_code(PlatformCodes::RATE_LIMITED))
}

pub fn is_suspended(envelope: &ResponseEnvelope) -> bool {
    platform_errors(envelope).iter().any(|error| {
        error.has_code(PlatformCodes::SUSPENDED) || error.has_code(PlatformCodes::LOCKED)
    })
}

pub fn classify(envelope: &ResponseEnvelope) -> Classification {
    Classification {
        bot_detected: is_bot_detected(envelope),
        duplicate: is_duplicate(envelope),
        rate_limited: is_rate_limited(envelope),
        suspended: is_suspended(envelope),
    }
}

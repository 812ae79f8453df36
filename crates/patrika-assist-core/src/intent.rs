//! The closed intent enumeration and classifier-output parsing.
//!
//! Classification never yields "no intent": every failure is an explicit
//! [`ClassificationError`] that callers collapse to [`Intent::Other`] with
//! [`resolve`].

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// What the user is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Refund process and policy.
    Refund,
    /// The Rajasthan Patrika publication itself; answered from the index.
    Rp,
    /// Advertisement booking, category not yet known.
    AdBooking,
    /// Ad booking flow for an individual customer.
    Customer,
    /// Ad booking flow for an agency.
    Agency,
    Other,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Refund,
        Intent::Rp,
        Intent::AdBooking,
        Intent::Customer,
        Intent::Agency,
        Intent::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Refund => "refund",
            Intent::Rp => "rp",
            Intent::AdBooking => "ad_booking",
            Intent::Customer => "customer",
            Intent::Agency => "agency",
            Intent::Other => "other",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = ClassificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
        Intent::ALL
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(label))
            .ok_or_else(|| ClassificationError::UnknownLabel(label.to_string()))
    }
}

/// Why a classification attempt produced no usable intent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("classifier returned an empty response")]
    Empty,
    #[error("classifier output could not be parsed: {0}")]
    Unparseable(String),
    #[error("classifier returned unknown intent '{0}'")]
    UnknownLabel(String),
    #[error("classifier call failed: {0}")]
    Upstream(String),
    #[error("classifier is disabled")]
    Disabled,
}

/// Collapse a classification result into an intent. Any error is `Other`.
pub fn resolve(result: Result<Intent, ClassificationError>) -> Intent {
    match result {
        Ok(intent) => intent,
        Err(_) => Intent::Other,
    }
}

/// Parse raw classifier output into an [`Intent`].
///
/// Accepts, in order of preference:
/// 1. a JSON object `{"intent": "<label>"}`, optionally wrapped in Markdown
///    code fences;
/// 2. the first `{...}` span inside surrounding prose that mentions
///    `"intent"`;
/// 3. a bare label such as `rp` or `"agency"`.
pub fn parse_classifier_output(raw: &str) -> Result<Intent, ClassificationError> {
    let cleaned = strip_code_fences(raw);
    if cleaned.is_empty() {
        return Err(ClassificationError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        return intent_from_json(&value);
    }

    if let Some(span) = embedded_intent_object(&cleaned) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(span) {
            return intent_from_json(&value);
        }
    }

    if !cleaned.contains(char::is_whitespace) {
        return cleaned.parse();
    }

    Err(ClassificationError::Unparseable(cleaned))
}

fn intent_from_json(value: &serde_json::Value) -> Result<Intent, ClassificationError> {
    match value {
        serde_json::Value::Object(map) => match map.get("intent") {
            Some(serde_json::Value::String(label)) => label.parse(),
            Some(other) => Err(ClassificationError::UnknownLabel(other.to_string())),
            None => Err(ClassificationError::Unparseable(value.to_string())),
        },
        serde_json::Value::String(label) => label.parse(),
        other => Err(ClassificationError::Unparseable(other.to_string())),
    }
}

/// Remove ```` ``` ```` / ```` ```json ```` fences and trim.
fn strip_code_fences(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find("```") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 3..];
        let lang_len = after
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(after.len());
        rest = &after[lang_len..];
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// First `{...}` span without nested braces that contains `"intent"`.
fn embedded_intent_object(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(open_rel) = text[search_from..].find('{') {
        let open = search_from + open_rel;
        let close_rel = text[open + 1..].find(['{', '}'])?;
        let close = open + 1 + close_rel;
        if text.as_bytes()[close] == b'}' {
            let span = &text[open..=close];
            if span.contains("\"intent\"") {
                return Some(span);
            }
        }
        search_from = close;
    }
    None
}

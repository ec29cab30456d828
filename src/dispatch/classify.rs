//! Failure classification for executor error text.

use std::sync::LazyLock;

use regex::Regex;

use crate::store::TaskErrorKind;

/// Ordered classification table; first match wins, anything unmatched is an
/// LLM error. Rate limiting is checked first because those failures are the
/// only ones retried automatically.
static CLASSIFIERS: LazyLock<Vec<(TaskErrorKind, Regex)>> = LazyLock::new(|| {
    vec![
        (
            TaskErrorKind::RateLimited,
            Regex::new(r"(?i)\b429\b|rate.?limit|too many requests|quota\s+(exceeded|reached)|overloaded")
                .unwrap(),
        ),
        (
            TaskErrorKind::ContextOverflow,
            Regex::new(
                r"(?i)context\s+(window|length|overflow)|token\s+limit|maximum\s+(context|tokens)|prompt is too long|input (is )?too (long|large)",
            )
            .unwrap(),
        ),
        (
            TaskErrorKind::ToolError,
            Regex::new(
                r"(?i)(tool|command|execution)\s.{0,40}(error|failed|failure)|no such file or directory|non.?zero exit|exit status [1-9]",
            )
            .unwrap(),
        ),
    ]
});

/// Map the final error text of a session to a failure kind.
pub fn classify_error(text: &str) -> TaskErrorKind {
    for (kind, pattern) in CLASSIFIERS.iter() {
        if pattern.is_match(text) {
            return *kind;
        }
    }
    TaskErrorKind::LlmError
}

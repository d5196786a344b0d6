use thiserror::Error;

/// Rejection of untrusted or malformed input.
///
/// Never retried: a bad plan, a bad edit or a bad requirement will not
/// correct itself on a second attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid requirement: {0}")]
    Requirement(String),

    #[error("malformed change plan: {0}")]
    MalformedPlan(String),

    #[error("malformed file edit #{index}: {reason}")]
    MalformedEdit { index: usize, reason: String },

    #[error("no file edits were produced")]
    NoEdits,

    #[error("path escapes the workspace root: {0}")]
    PathEscape(String),
}

//! Output classification shared by every backend: sorts agent stdout/stderr
//! into the failure categories the loop runner reacts to.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Coarse-grained outcome of one iteration's output, used to pick the loop
/// runner's next action (retry, failover, abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// No failure markers observed.
    Success,
    /// Authentication/session expired; switching backend won't help.
    AuthError,
    /// Provider is throttling requests; worth a backoff-and-retry.
    RateLimit,
    /// Context window exceeded; the agent needs a fresh session.
    ContextLimit,
    /// An error occurred but doesn't match a known category.
    UnknownError,
}

struct CompiledPattern {
    regex: Regex,
    category: FailureCategory,
}

static PATTERNS: OnceLock<Vec<CompiledPattern>> = OnceLock::new();

fn patterns() -> &'static Vec<CompiledPattern> {
    PATTERNS.get_or_init(|| {
        vec![
            CompiledPattern {
                regex: Regex::new(r"(?i)context\s+(window|limit)\s+(exceeded|reached)").unwrap(),
                category: FailureCategory::ContextLimit,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)prompt\s+is\s+too\s+long").unwrap(),
                category: FailureCategory::ContextLimit,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)(invalid|expired)\s+api\s*key").unwrap(),
                category: FailureCategory::AuthError,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)authentication\s+(failed|error|required)").unwrap(),
                category: FailureCategory::AuthError,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)please\s+(log|sign)\s*in").unwrap(),
                category: FailureCategory::AuthError,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)unauthorized").unwrap(),
                category: FailureCategory::AuthError,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)\b429\b\s*(?:too many requests|rate limit)?").unwrap(),
                category: FailureCategory::RateLimit,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)rate[_\-\s]?limit(ed|ing)?").unwrap(),
                category: FailureCategory::RateLimit,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)too\s+many\s+requests").unwrap(),
                category: FailureCategory::RateLimit,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)quota\s*(exceeded|limit)").unwrap(),
                category: FailureCategory::RateLimit,
            },
            CompiledPattern {
                regex: Regex::new(r"(?i)overloaded").unwrap(),
                category: FailureCategory::RateLimit,
            },
        ]
    })
}

/// Classify combined stdout/stderr tail from one iteration. Checked in
/// declaration order, most specific first, so a context-limit message
/// phrased with "exceeded" doesn't fall through to the generic rate-limit
/// bucket.
pub fn classify(output: &str) -> FailureCategory {
    for pattern in patterns() {
        if pattern.regex.is_match(output) {
            return pattern.category;
        }
    }
    FailureCategory::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_context_limit() {
        assert_eq!(
            classify("Error: context window exceeded for this request"),
            FailureCategory::ContextLimit
        );
    }

    #[test]
    fn classifies_auth_error() {
        assert_eq!(
            classify("Error: invalid api key provided"),
            FailureCategory::AuthError
        );
    }

    #[test]
    fn classifies_rate_limit() {
        assert_eq!(
            classify("429 Too Many Requests"),
            FailureCategory::RateLimit
        );
    }

    #[test]
    fn classifies_clean_output_as_success() {
        assert_eq!(
            classify("Wrote 3 files, all tests passing"),
            FailureCategory::Success
        );
    }

    #[test]
    fn context_limit_checked_before_generic_rate_limit() {
        // Contains both "exceeded" and nothing rate-limit-specific; make sure
        // the context pattern wins when both phrasings could plausibly apply.
        assert_eq!(
            classify("context limit reached, please start a new session"),
            FailureCategory::ContextLimit
        );
    }
}

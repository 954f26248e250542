//! Failure classification.
//!
//! One pure, total function maps an error's `code` and message onto the
//! closed [`ErrorType`] taxonomy. Retry policy and the per-run error log both
//! go through it, so they can never disagree about a failure.
//!
//! Predicates run in a fixed order and the first match wins:
//! 1. network (timeouts, DNS, refused/reset connections, HTTP 5xx)
//! 2. authentication (HTTP 401/403, forbidden, token and credential wording)
//! 3. rate limit (HTTP 429, quota wording)
//! 4. permission (privilege wording, SQL state 42501)
//! 5. data integrity (constraint violations, duplicate keys)
//! 6. validation (malformed or missing values, HTTP 400/422)
//! 7. unknown

use crate::types::ErrorType;

const NETWORK_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EPIPE",
];

const NETWORK_TEXT: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "getaddrinfo",
    "dns",
    "network",
    "socket hang up",
    "broken pipe",
    "unreachable",
    "service unavailable",
    "bad gateway",
];

const AUTH_TEXT: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "forbidden",
    "invalid token",
    "token expired",
    "expired token",
    "invalid credentials",
    "invalid_grant",
    "invalid api key",
];

const RATE_LIMIT_TEXT: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "resource exhausted",
];

const PERMISSION_TEXT: &[&str] = &[
    "permission denied",
    "insufficient permission",
    "insufficient privilege",
    "access denied",
    "not permitted",
];

const INTEGRITY_CODES: &[&str] = &["23505", "23503", "23502", "23514", "23P01", "409"];

const INTEGRITY_TEXT: &[&str] = &[
    "duplicate key",
    "duplicate",
    "unique constraint",
    "foreign key",
    "violates",
    "constraint",
    "integrity",
    "conflict",
];

const VALIDATION_CODES: &[&str] = &["22P02", "22001", "22003", "22007", "400", "422"];

const VALIDATION_TEXT: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "required",
    "must be",
    "out of range",
    "cannot be null",
    "unexpected type",
];

/// Classify a failure by its optional machine code and free-text message.
///
/// Never panics; an unrecognised failure is [`ErrorType::Unknown`].
pub fn classify(code: Option<&str>, message: &str) -> ErrorType {
    let code = code.map(str::trim).filter(|c| !c.is_empty());
    let status = code.and_then(|c| c.parse::<u16>().ok());
    let text = message.to_lowercase();

    let code_in = |set: &[&str]| code.is_some_and(|c| set.iter().any(|s| s.eq_ignore_ascii_case(c)));
    let text_has = |set: &[&str]| set.iter().any(|needle| text.contains(needle));

    if code_in(NETWORK_CODES)
        || matches!(status, Some(500..=599) | Some(408))
        || text_has(NETWORK_TEXT)
    {
        return ErrorType::Network;
    }
    if matches!(status, Some(401) | Some(403)) || text_has(AUTH_TEXT) {
        return ErrorType::Authentication;
    }
    if status == Some(429) || text_has(RATE_LIMIT_TEXT) {
        return ErrorType::RateLimit;
    }
    if code == Some("42501") || text_has(PERMISSION_TEXT) {
        return ErrorType::Permission;
    }
    if code_in(INTEGRITY_CODES) || text_has(INTEGRITY_TEXT) {
        return ErrorType::DataIntegrity;
    }
    if code_in(VALIDATION_CODES) || text_has(VALIDATION_TEXT) {
        return ErrorType::Validation;
    }
    ErrorType::Unknown
}

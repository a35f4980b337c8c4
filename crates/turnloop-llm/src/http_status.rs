//! HTTP status → typed error code mapping (spec §4.3, §7).
//!
//! Grounded on `llm/client_httpx_errors.py`'s status-to-code table.

use turnloop_core::ErrorCode;

pub fn error_code_for_status(status: u16) -> ErrorCode {
    match status {
        401 => ErrorCode::Auth,
        403 => ErrorCode::Permission,
        404 => ErrorCode::NotFound,
        408 => ErrorCode::Timeout,
        409 => ErrorCode::Conflict,
        422 => ErrorCode::Unprocessable,
        429 => ErrorCode::RateLimit,
        400..=499 => ErrorCode::BadRequest,
        500..=599 => ErrorCode::ServerError,
        _ => ErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_statuses() {
        assert_eq!(error_code_for_status(401), ErrorCode::Auth);
        assert_eq!(error_code_for_status(429), ErrorCode::RateLimit);
        assert_eq!(error_code_for_status(503), ErrorCode::ServerError);
        assert_eq!(error_code_for_status(418), ErrorCode::BadRequest);
    }
}

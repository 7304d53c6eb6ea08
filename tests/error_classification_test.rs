use axum::http::StatusCode;
use refract::types::{classify_upstream_failure, error_type_for_status};

#[test]
fn taxonomy_covers_the_known_failure_families() {
    let cases = [
        ("401 Unauthorized", StatusCode::UNAUTHORIZED, "authentication_error"),
        ("invalid api key supplied", StatusCode::UNAUTHORIZED, "authentication_error"),
        ("permission denied for model", StatusCode::FORBIDDEN, "permission_error"),
        ("HTTP 429: slow down", StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
        ("rate limit exceeded for org", StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
        ("operation timed out", StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
        ("connection refused by peer", StatusCode::BAD_GATEWAY, "upstream_error"),
        ("could not resolve host", StatusCode::BAD_GATEWAY, "upstream_error"),
        ("inscrutable upstream mumble", StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
    ];

    for (text, expected_status, expected_type) in cases {
        let (status, error_type) = classify_upstream_failure(text);
        assert_eq!(status, expected_status, "status for {:?}", text);
        assert_eq!(error_type, expected_type, "type for {:?}", text);
    }
}

#[test]
fn status_to_error_type_mapping_is_stable() {
    assert_eq!(error_type_for_status(StatusCode::BAD_REQUEST), "invalid_request_error");
    assert_eq!(error_type_for_status(StatusCode::UNAUTHORIZED), "authentication_error");
    assert_eq!(error_type_for_status(StatusCode::FORBIDDEN), "permission_error");
    assert_eq!(error_type_for_status(StatusCode::TOO_MANY_REQUESTS), "rate_limit_error");
    assert_eq!(error_type_for_status(StatusCode::PAYLOAD_TOO_LARGE), "request_too_large");
    assert_eq!(error_type_for_status(StatusCode::BAD_GATEWAY), "upstream_error");
    assert_eq!(error_type_for_status(StatusCode::GATEWAY_TIMEOUT), "timeout_error");
    assert_eq!(error_type_for_status(StatusCode::INTERNAL_SERVER_ERROR), "api_error");
}

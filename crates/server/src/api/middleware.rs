//! Bearer-key authentication and request metrics.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::metrics::{
    normalize_path, AUTH_FAILURES_TOTAL, HTTP_REQUESTS_IN_FLIGHT, HTTP_REQUESTS_TOTAL,
    HTTP_REQUEST_DURATION,
};
use crate::state::AppState;

/// Records duration, count and in-flight gauge for every request.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());

    HTTP_REQUESTS_IN_FLIGHT.inc();
    let response = next.run(request).await;
    HTTP_REQUESTS_IN_FLIGHT.dec();

    let status = response.status().as_u16().to_string();
    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &path, &status])
        .observe(start.elapsed().as_secs_f64());
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    response
}

/// Validates `Authorization: Bearer <api_key>` when a key is configured.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.api_key() else {
        // No key configured: the endpoint is open.
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            AUTH_FAILURES_TOTAL
                .with_label_values(&["invalid_key"])
                .inc();
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            AUTH_FAILURES_TOTAL
                .with_label_values(&["missing_key"])
                .inc();
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}

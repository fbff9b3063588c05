//! Basic Auth middleware.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use tracing::{debug, warn};

use crate::access::Outcome;

/// Authenticated username, inserted into request extensions by the auth middleware.
#[derive(Clone)]
pub(crate) struct AuthUser(pub(crate) String);

impl AuthUser {
    pub(crate) const ANONYMOUS: &'static str = "anonymous";
}

// ============================================================
// Basic Auth middleware
// ============================================================

fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"rdv\"")],
        "Unauthorized",
    )
        .into_response();
    response
        .extensions_mut()
        .insert(Outcome("unauthorized".to_string()));
    response
}

fn decode_basic(value: &str) -> Result<(String, String), &'static str> {
    let encoded = value.strip_prefix("Basic ").ok_or("not basic auth")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| "invalid base64")?;
    let decoded = String::from_utf8(decoded).map_err(|_| "invalid utf8")?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or("malformed credentials")?;
    Ok((user.to_owned(), pass.to_owned()))
}

pub(crate) async fn basic_auth_middleware(
    State(creds): State<Arc<(String, String)>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if path == "/api/v1/health" {
        return next.run(req).await;
    }

    let Some(auth_header) = req.headers().get(header::AUTHORIZATION) else {
        warn!(path = %path, "auth failed: no authorization header");
        return unauthorized();
    };
    let Ok(auth_str) = auth_header.to_str() else {
        warn!(path = %path, "auth failed: invalid header encoding");
        return unauthorized();
    };
    let (user, pass) = match decode_basic(auth_str) {
        Ok(pair) => pair,
        Err(reason) => {
            warn!(path = %path, reason, "auth failed");
            return unauthorized();
        }
    };

    if user != creds.0 || pass != creds.1 {
        warn!(user = %user, path = %path, "auth failed: invalid credentials");
        return unauthorized();
    }

    debug!(user = %user, path = %path, "authenticated");
    let auth_user = AuthUser(user);
    req.extensions_mut().insert(auth_user.clone());
    let mut response = next.run(req).await;
    response.extensions_mut().insert(auth_user);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_basic_header() {
        // "ops:s3cret"
        assert_eq!(
            decode_basic("Basic b3BzOnMzY3JldA=="),
            Ok(("ops".to_string(), "s3cret".to_string()))
        );
        assert_eq!(decode_basic("Bearer abc"), Err("not basic auth"));
        assert_eq!(decode_basic("Basic !!!"), Err("invalid base64"));
        // "nocolon"
        assert_eq!(decode_basic("Basic bm9jb2xvbg=="), Err("malformed credentials"));
    }

    #[test]
    fn rejection_is_tagged_for_the_access_log() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.extensions().get::<Outcome>(),
            Some(&Outcome("unauthorized".to_string()))
        );
    }
}

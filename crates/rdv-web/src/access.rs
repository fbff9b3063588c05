//! Access log: one line per API call with its route group and outcome.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::auth::AuthUser;

/// Error kind of a rejected call, attached to the response that reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Outcome(pub(crate) String);

/// Route group for `path`. Documentation routes are not logged.
fn route_group(path: &str) -> Option<&'static str> {
    if path.starts_with("/swagger-ui") || path.starts_with("/api-docs") {
        return None;
    }
    let group = match path.strip_prefix("/api/v1/").and_then(|p| p.split('/').next()) {
        Some("health") => "health",
        Some("query") => "query",
        Some("ops") => "ops",
        _ => "other",
    };
    Some(group)
}

pub(crate) async fn access_log(req: Request, next: Next) -> Response {
    let Some(group) = route_group(req.uri().path()) else {
        return next.run(req).await;
    };
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "-".to_owned());
    let started = Instant::now();

    let response = next.run(req).await;

    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    let user = response.extensions().get::<AuthUser>().map_or("-", |u| u.0.as_str());
    let outcome = response
        .extensions()
        .get::<Outcome>()
        .map_or("ok", |o| o.0.as_str());
    if response.status().is_server_error() {
        warn!(client, user, group, status, outcome, latency_ms, "{method} {path}");
    } else {
        info!(client, user, group, status, outcome, latency_ms, "{method} {path}");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_follow_api_prefix() {
        assert_eq!(route_group("/api/v1/query/execute"), Some("query"));
        assert_eq!(route_group("/api/v1/ops/signal"), Some("ops"));
        assert_eq!(route_group("/api/v1/health"), Some("health"));
        assert_eq!(route_group("/favicon.ico"), Some("other"));
        assert_eq!(route_group("/swagger-ui/index.html"), None);
        assert_eq!(route_group("/api-docs/openapi.json"), None);
    }
}

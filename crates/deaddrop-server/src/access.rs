use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{ORIGIN, REFERER, USER_AGENT};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::ServerError;

/// User-Agent substrings of automation clients the API refuses.
const BLOCKED_AGENTS: &[&str] = &[
    "curl", "wget", "python-requests", "python-urllib", "httpie", "go-http-client", "scrapy",
    "bot", "spider", "crawler",
];

/// API access filter: refuse automation User-Agents, and when an origin
/// allow-list is configured, require a matching `Origin` or `Referer`.
/// Download and WebSocket paths are not behind this filter; browser
/// navigation requests do not reliably carry an Origin header.
pub async fn access_policy(
    State(config): State<Arc<ServerConfig>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let headers = req.headers();

    if let Some(agent) = header_str(headers, USER_AGENT.as_str()) {
        if agent_blocked(agent) {
            warn!(agent = %agent, "Blocked automation client");
            return Err(ServerError::Forbidden(
                "Automated clients are not allowed".to_string(),
            ));
        }
    }

    if !config.allowed_origins.is_empty() {
        let origin = header_str(headers, ORIGIN.as_str())
            .or_else(|| header_str(headers, REFERER.as_str()));
        if !origin.is_some_and(|value| origin_allowed(value, &config.allowed_origins)) {
            warn!(origin = ?origin, "Blocked disallowed origin");
            return Err(ServerError::Forbidden("Origin not allowed".to_string()));
        }
    }

    Ok(next.run(req).await)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn agent_blocked(agent: &str) -> bool {
    let agent = agent.to_ascii_lowercase();
    BLOCKED_AGENTS.iter().any(|marker| agent.contains(marker))
}

fn origin_allowed(value: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|prefix| value.starts_with(prefix))
}

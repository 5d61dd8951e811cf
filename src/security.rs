use crate::models::{Actor, ApiError, Role};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

/// Used when `DEMO_API_KEYS` is unset. Never an admin.
const DEFAULT_KEYS: &str = "1:user:demo-key";

/// API keys mapped to the actor they authenticate. Identity and roles are
/// issued elsewhere; this layer only resolves them.
#[derive(Clone)]
pub struct AuthState {
    actors: Arc<HashMap<String, Actor>>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("DEMO_API_KEYS").unwrap_or_else(|_| DEFAULT_KEYS.to_string());
        Self {
            actors: Arc::new(parse_keys(&raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<Actor> {
        self.actors.get(presented).copied()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Listing-Key or Bearer token",
        ));
    };
    let Some(actor) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

/// Resolves the caller when a key is present, without rejecting anonymous
/// requests. Used by the public read routes to skip owner views.
pub async fn optional_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if let Some(actor) =
        extract_api_key(request.headers()).and_then(|presented| state.authenticate(&presented))
    {
        request.extensions_mut().insert(actor);
    }
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Listing-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// `DEMO_API_KEYS` is a comma-separated list of `user_id:role:key`.
fn parse_keys(raw: &str) -> HashMap<String, Actor> {
    let mut entries = HashMap::new();
    for token in raw.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(3, ':').map(str::trim);
        let id = parts.next().and_then(|s| s.parse::<u64>().ok());
        let role = parts.next().and_then(Role::from_str);
        let key = parts.next().filter(|s| !s.is_empty());
        match (id, role, key) {
            (Some(id), Some(role), Some(secret)) => {
                entries.insert(secret.to_string(), Actor::new(id, role));
            }
            _ => warn!(
                target = "listings.api",
                "ignored malformed DEMO_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "listings.api",
            "DEMO_API_KEYS produced no keys; falling back to an unprivileged demo key"
        );
        entries.insert("demo-key".to_string(), Actor::new(1, Role::User));
    } else {
        info!(
            target = "listings.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn keys_resolve_to_actors() {
        let keys = parse_keys("10:user:alpha, 11:DEALER:beta,bogus,12:pilot:gamma");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.get("alpha"), Some(&Actor::new(10, Role::User)));
        assert_eq!(keys.get("beta"), Some(&Actor::new(11, Role::Dealer)));
        assert!(!keys.contains_key("gamma"));
    }

    #[test]
    fn empty_config_falls_back_to_demo_key() {
        let keys = parse_keys(" , ");
        assert_eq!(keys.get("demo-key"), Some(&Actor::new(1, Role::User)));
        assert!(!keys.values().any(Actor::is_admin));
    }

    #[test]
    fn unset_keys_never_grant_admin() {
        let state = AuthState {
            actors: Arc::new(parse_keys(DEFAULT_KEYS)),
        };
        let actor = state.authenticate("demo-key").expect("demo key resolves");
        assert!(!actor.is_admin());
    }

    #[test]
    fn bearer_wins_over_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert("X-Listing-Key", HeaderValue::from_static("from-header"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-header"));
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-bearer"));
    }
}

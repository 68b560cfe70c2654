//! Follow action: resolve a target handle to a numeric id if
//! needed, issue the signed follow call, and classify the result into a
//! `FollowOutcome`. Never raises for classified upstream failures — only
//! transport-layer bugs panic.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, ClientResponse, WorkerClient};
use crate::errors::FollowOutcome;
use crate::signing::{sign_v2, CookieAuthHeaders, OAuthCredentials};

const GRAPHQL_LOOKUP_BASE: &str = "https://api.twitter.com/i/api/graphql/lookup/UserByScreenName";
const FOLLOWING_ENDPOINT_BASE: &str = "https://api.twitter.com/2/users";

fn looks_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Resolves a screen name to its numeric id via the GraphQL-shaped
/// `UserByScreenName` lookup (cookie + CSRF + public bearer, no per-request
/// signature). If `target` already looks numeric, it is returned unchanged.
pub async fn resolve_user_id(
    client: &WorkerClient,
    target: &str,
    cookie_auth: &CookieAuthHeaders,
    cancel: &CancellationToken,
) -> Result<String, FollowOutcome> {
    if looks_numeric(target) {
        return Ok(target.to_string());
    }

    let url = format!("{GRAPHQL_LOOKUP_BASE}?screen_name={target}");

    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        HeaderValue::from_str(&cookie_auth.authorization_value()).map_err(|_| invalid_header())?,
    );
    headers.insert(
        HeaderName::from_static("x-csrf-token"),
        HeaderValue::from_str(&cookie_auth.csrf_token).map_err(|_| invalid_header())?,
    );
    headers.insert(
        reqwest::header::COOKIE,
        HeaderValue::from_str(&cookie_auth.cookie_header_value()).map_err(|_| invalid_header())?,
    );

    let response = client
        .execute(Method::GET, &url, headers, None, Duration::from_secs(900), cancel)
        .await
        .map_err(client_error_to_outcome)?;

    match response {
        ClientResponse::Json(body) => extract_user_id(&body).ok_or_else(|| {
            FollowOutcome::ApiError("UserByScreenName response missing user id".to_string())
        }),
        ClientResponse::Empty => Err(FollowOutcome::ApiError(
            "UserByScreenName returned an empty body".to_string(),
        )),
    }
}

fn extract_user_id(body: &Value) -> Option<String> {
    body.pointer("/data/user/result/rest_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn invalid_header() -> FollowOutcome {
    FollowOutcome::ApiError("invalid credential header value".to_string())
}

/// Issues `POST /2/users/{self_id}/following` with `{"target_user_id": ...}`,
/// where `self_id` is the prefix of the access token before the first `-`.
pub async fn follow_user(
    client: &WorkerClient,
    target_user_id: &str,
    creds: &OAuthCredentials,
    rate_limit_cooldown: Duration,
    cancel: &CancellationToken,
) -> FollowOutcome {
    let Some(self_id) = creds.numeric_user_id() else {
        return FollowOutcome::ApiError("access token missing numeric id prefix".to_string());
    };

    let url = format!("{FOLLOWING_ENDPOINT_BASE}/{self_id}/following");
    let body = serde_json::json!({ "target_user_id": target_user_id });

    let mut headers = HeaderMap::new();
    let auth_header = sign_v2("POST", &url, creds, Utc::now().timestamp());
    match HeaderValue::from_str(&auth_header) {
        Ok(value) => {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        Err(_) => return invalid_header(),
    }

    let response = client
        .execute(Method::POST, &url, headers, Some(body), rate_limit_cooldown, cancel)
        .await;

    match response {
        Ok(ClientResponse::Empty) => FollowOutcome::Ok,
        Ok(ClientResponse::Json(body)) => classify_follow_response(&body),
        Err(e) => client_error_to_outcome(e),
    }
}

fn classify_follow_response(body: &Value) -> FollowOutcome {
    if body.pointer("/data/following").and_then(Value::as_bool) == Some(true) {
        return FollowOutcome::Ok;
    }

    if let Some(code) = first_error_code(body) {
        return match code {
            88 => FollowOutcome::RateLimited,
            50 => FollowOutcome::NotFound,
            63 => FollowOutcome::Suspended,
            _ => FollowOutcome::ApiError(
                first_error_message(body).unwrap_or_else(|| format!("upstream error code {code}")),
            ),
        };
    }

    if let Some(message) = first_error_message(body) {
        return FollowOutcome::ApiError(message);
    }

    FollowOutcome::ApiError("unrecognized upstream response shape".to_string())
}

fn first_error_code(body: &Value) -> Option<i64> {
    body.get("errors")?.as_array()?.first()?.get("code")?.as_i64()
}

fn first_error_message(body: &Value) -> Option<String> {
    body.get("errors")?
        .as_array()?
        .first()?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

fn client_error_to_outcome(e: ClientError) -> FollowOutcome {
    match e {
        ClientError::Auth => FollowOutcome::Unauthorized,
        ClientError::RateLimitExhausted => FollowOutcome::RateLimited,
        ClientError::Timeout => FollowOutcome::TransportError("timed out after retries".to_string()),
        ClientError::Transport(msg) => FollowOutcome::TransportError(msg),
        ClientError::Cancelled => FollowOutcome::Cancelled,
    }
}

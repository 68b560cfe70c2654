//! OAuth1-style request signing (HMAC-SHA1) for the upstream social API.
//!
//! Independent of the HTTP layer: given a method, URL, and parameter set, this
//! module produces the `Authorization` header value. Percent-encoding follows
//! RFC 3986's unreserved set (`ALPHA / DIGIT / "-" / "." / "_" / "~"`), matching
//! the upstream's own encoding of the signature base string.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const RFC3986_UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The OAuth1 credential quintuple for a worker.
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

impl OAuthCredentials {
    /// The numeric self id embedded as the prefix of the access token, before
    /// the first `-` (e.g. `"123456789-abcDEF"` -> `"123456789"`).
    pub fn numeric_user_id(&self) -> Option<&str> {
        self.access_token.split('-').next()
    }
}

pub fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, RFC3986_UNRESERVED).to_string()
}

fn generate_nonce() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn oauth_base_params(creds: &OAuthCredentials, timestamp: i64, nonce: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("oauth_consumer_key".to_string(), creds.consumer_key.clone());
    params.insert("oauth_nonce".to_string(), nonce.to_string());
    params.insert("oauth_signature_method".to_string(), "HMAC-SHA1".to_string());
    params.insert("oauth_timestamp".to_string(), timestamp.to_string());
    params.insert("oauth_token".to_string(), creds.access_token.clone());
    params.insert("oauth_version".to_string(), "1.0".to_string());
    params
}

/// Flattens a JSON object one level deep into dotted string keys, per the
/// v1.1 family's body-field folding into the signature.
pub fn flatten_json_one_level(value: &serde_json::Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            match v {
                serde_json::Value::Object(inner) => {
                    for (ik, iv) in inner {
                        out.insert(format!("{k}.{ik}"), stringify(iv));
                    }
                }
                other => {
                    out.insert(k.clone(), stringify(other));
                }
            }
        }
    }
    out
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds `METHOD&url-encoded(URL)&url-encoded(sorted-param-string)`.
pub fn signature_base_string(method: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    )
}

fn sign_base_string(base_string: &str, consumer_secret: &str, access_secret: &str) -> String {
    let signing_key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(access_secret)
    );
    let mut mac = HmacSha1::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(base_string.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn authorization_header(oauth_params: &BTreeMap<String, String>) -> String {
    let parts = oauth_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {parts}")
}

/// Signs a "v2" family request (e.g. `POST /2/users/{id}/following`): only
/// the OAuth parameters participate in the signature base string.
pub fn sign_v2(method: &str, url: &str, creds: &OAuthCredentials, now_unix: i64) -> String {
    let nonce = generate_nonce();
    let mut oauth_params = oauth_base_params(creds, now_unix, &nonce);
    let base_string = signature_base_string(method, url, &oauth_params);
    let signature = sign_base_string(&base_string, &creds.consumer_secret, &creds.access_secret);
    oauth_params.insert("oauth_signature".to_string(), signature);
    authorization_header(&oauth_params)
}

/// Signs a "v1.1" family request: query parameters and one-level-flattened
/// JSON body fields are folded into the signature base string, but are not
/// part of the emitted header.
pub fn sign_v1_1(
    method: &str,
    url: &str,
    query_params: &BTreeMap<String, String>,
    body_fields: &BTreeMap<String, String>,
    creds: &OAuthCredentials,
    now_unix: i64,
) -> String {
    let nonce = generate_nonce();
    let mut all_params = oauth_base_params(creds, now_unix, &nonce);
    for (k, v) in query_params {
        all_params.insert(k.clone(), v.clone());
    }
    for (k, v) in body_fields {
        all_params.insert(k.clone(), v.clone());
    }

    let base_string = signature_base_string(method, url, &all_params);
    let signature = sign_base_string(&base_string, &creds.consumer_secret, &creds.access_secret);

    let mut oauth_only = oauth_base_params(creds, now_unix, &nonce);
    oauth_only.insert("oauth_signature".to_string(), signature);
    authorization_header(&oauth_only)
}

/// Header set for cookie-and-CSRF site-origin endpoints: no per-request
/// signature, just a public bearer, the CSRF token echoed from the session
/// cookie, and the cookie pair.
#[derive(Debug, Clone)]
pub struct CookieAuthHeaders {
    pub public_bearer: String,
    pub csrf_token: String,
    pub auth_cookie: String,
    pub csrf_cookie: String,
}

impl CookieAuthHeaders {
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.public_bearer)
    }

    pub fn cookie_header_value(&self) -> String {
        format!("auth_token={}; ct0={}", self.auth_cookie, self.csrf_cookie)
    }
}

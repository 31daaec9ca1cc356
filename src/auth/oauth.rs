//! OAuth redirect callback parsing.
//!
//! The backend finishes the provider flow by redirecting to
//! `<frontend>/auth/callback#token=<jwt>&userID=<id>`. The payload travels in
//! the URL fragment so it never reaches server access logs. A callback that
//! carries the token in the query string is refused.

use url::Url;

use crate::error::ClientError;

/// Token payload recovered from a callback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCallback {
    pub token: String,
    pub user_id: Option<String>,
}

/// Parse the token payload out of an OAuth callback URL.
pub fn parse_callback(callback_url: &str) -> Result<OAuthCallback, ClientError> {
    let url = Url::parse(callback_url)
        .map_err(|e| ClientError::Validation(format!("invalid callback URL: {e}")))?;

    if url.query_pairs().any(|(k, _)| k == "token") {
        return Err(ClientError::Validation(
            "callback carries the token in the query string".to_string(),
        ));
    }

    if let Some(error) = url
        .query_pairs()
        .chain(fragment_pairs(&url))
        .find(|(k, _)| k == "error")
        .map(|(_, v)| v.into_owned())
    {
        return Err(ClientError::Validation(format!("provider error: {error}")));
    }

    let mut token = None;
    let mut user_id = None;
    for (key, value) in fragment_pairs(&url) {
        match key.as_ref() {
            "token" => token = Some(value.into_owned()),
            "userID" | "userId" | "user_id" => user_id = Some(value.into_owned()),
            _ => {}
        }
    }

    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ClientError::Validation("callback fragment has no token".to_string()))?;

    Ok(OAuthCallback { token, user_id })
}

fn fragment_pairs(url: &Url) -> url::form_urlencoded::Parse<'_> {
    url::form_urlencoded::parse(url.fragment().unwrap_or_default().as_bytes())
}

// Last.fm authentication helper
// Token flow: request a token, let the user authorize it in a browser, exchange it for a session

use anyhow::{Context, Result};
use rustfm_scrobble_proxy::Scrobbler;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

pub const LASTFM_API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
pub const LASTFM_AUTH_URL: &str = "https://www.last.fm/api/auth/";

/// Sign a Last.fm API call: md5 over the parameters sorted by name, each
/// name immediately followed by its value, then the shared secret.
/// `format` and `callback` are never part of the signature.
fn sign(params: &BTreeMap<&str, String>, api_secret: &str) -> String {
    let mut payload = String::new();
    for (key, value) in params {
        if *key == "format" || *key == "callback" {
            continue;
        }
        payload.push_str(key);
        payload.push_str(value);
    }
    payload.push_str(api_secret);
    format!("{:x}", md5::compute(payload.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    error: Option<i64>,
    message: Option<String>,
}

/// Authorized Last.fm session
#[derive(Debug, Clone)]
pub struct LastFmSession {
    pub key: String,
    pub username: String,
}

/// Ask Last.fm for an unauthorized request token (`auth.getToken`)
pub fn request_token(api_key: &str, api_secret: &str) -> Result<String> {
    let mut params = BTreeMap::new();
    params.insert("method", "auth.getToken".to_string());
    params.insert("api_key", api_key.to_string());
    let signature = sign(&params, api_secret);

    let response = attohttpc::get(LASTFM_API_URL)
        .param("method", "auth.getToken")
        .param("api_key", api_key)
        .param("api_sig", signature)
        .param("format", "json")
        .send()
        .context("Failed to reach Last.fm")?;

    let body = response.text().context("Failed to read Last.fm response")?;
    parse_token_response(&body)
}

fn parse_token_response(body: &str) -> Result<String> {
    let parsed: TokenResponse =
        serde_json::from_str(body).context("Failed to parse Last.fm token response")?;

    if let Some(code) = parsed.error {
        anyhow::bail!(
            "Last.fm refused to issue a token ({}): {}",
            code,
            parsed.message.unwrap_or_default()
        );
    }

    parsed.token.context("Last.fm response did not contain a token")
}

/// URL the user must visit to authorize `token`
pub fn authorization_url(api_key: &str, token: &str) -> String {
    format!("{}?api_key={}&token={}", LASTFM_AUTH_URL, api_key, token)
}

/// Perform the complete interactive authorization flow.
/// Returns the session on success.
pub fn authenticate(api_key: &str, api_secret: &str) -> Result<LastFmSession> {
    println!("Starting Last.fm authentication...\n");

    let token = request_token(api_key, api_secret)?;

    println!("Open this URL in your browser and allow access:\n");
    println!("    {}\n", authorization_url(api_key, &token));
    print!("Press Enter once access has been granted...");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    println!("\nExchanging token for a session...");
    let mut scrobbler = Scrobbler::new(api_key, api_secret);
    let session = scrobbler
        .authenticate_with_token(&token)
        .context("Failed to obtain a Last.fm session; was access granted?")?;
    println!("Session key obtained successfully!\n");

    Ok(LastFmSession {
        key: session.key,
        username: session.name,
    })
}

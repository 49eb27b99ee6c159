use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::error::UploaderError;

/// Immutable authenticated handle. Recreated on expiry, never mutated.
#[derive(Debug, Clone)]
pub struct Session {
    token: String,
    api_root: String,
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct SessionManager {
    client: Client,
    config: Config,
    // Guards the probe-then-maybe-refresh sequence; concurrent callers must
    // never race to re-authenticate.
    current: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Result<Self, UploaderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("lims-ru/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| UploaderError::Connection(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| UploaderError::Connection(err.to_string()))?;

        Ok(Self {
            client,
            config,
            current: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns a live session, transparently re-authenticating when the
    /// current one fails the liveness probe.
    pub fn get_session(&self) -> Result<Session, UploaderError> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| UploaderError::Connection("session lock poisoned".to_string()))?;

        if let Some(session) = guard.as_ref() {
            if self.probe(session) {
                return Ok(session.clone());
            }
            debug!("session probe failed, re-authenticating");
        }

        let session = self.authenticate()?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Liveness check against the API root. Any non-success or transport
    /// failure counts as dead, not as a hard error.
    fn probe(&self, session: &Session) -> bool {
        self.client
            .get(session.api_root())
            .bearer_auth(session.token())
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    fn authenticate(&self) -> Result<Session, UploaderError> {
        let api_root = self.config.api_root();
        let token_url = format!("{api_root}/oauth/token");
        let form = [
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];

        let response = self
            .client
            .post(&token_url)
            .form(&form)
            .send()
            .map_err(|err| UploaderError::Connection(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "token request failed".to_string());
            return Err(UploaderError::Authentication(format!(
                "token endpoint returned {status}: {message}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|err| UploaderError::Contract(format!("malformed token response: {err}")))?;

        debug!("acquired access token");
        Ok(Session {
            token: token.access_token,
            api_root,
        })
    }
}

/// Bounded retries with linear backoff for transient faults. Only used for
/// idempotent GETs; creates go out exactly once.
pub(crate) fn send_with_retries<F>(
    mut make_req: F,
) -> Result<reqwest::blocking::Response, UploaderError>
where
    F: FnMut() -> reqwest::blocking::RequestBuilder,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        let response = make_req().send();
        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Err(UploaderError::Connection(err.to_string()));
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

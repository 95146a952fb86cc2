use std::thread;
use std::time::Duration;

use base64;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use super::MetaError;

const REQUEST_TIMEOUT_SECS: u64 = 15;

// Retry frequently to prevent I/O locking up for long
const RETRY_COUNT: u32 = 120;
const BACKOFF_FACTOR: f64 = 0.1;
const BACKOFF_MAX: f64 = 1.0;

/// Typed request helper for the metaserver's `/client/` API.
///
/// Both request kinds return the decoded JSON payload on success. A 200
/// response carrying an `{"error": …}` envelope is surfaced as
/// `MetaError::Remote`; everything else is a transport-level failure.
pub struct MetaClient {
    base_url: String,
    auth: HeaderMap,
    http: Client
}

impl MetaClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, MetaError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let mut auth = HeaderMap::new();
        // base64 output is always valid header material
        auth.insert("X-DSN-Username", HeaderValue::from_str(&base64::encode(username)).unwrap());
        auth.insert("X-DSN-Password", HeaderValue::from_str(&base64::encode(password)).unwrap());
        Ok(MetaClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: auth,
            http: http
        })
    }

    /// The shared HTTP client, also used for chunk server traffic.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn get(&self, method: &str, params: &[(&str, String)]) -> Result<Value, MetaError> {
        let url = self.url(method);
        debug!("Making request to url {} with params {:?}", url, params);
        self.request(|| self.http.get(url.as_str()).headers(self.auth.clone()).query(params))
    }

    pub fn post(&self, method: &str, body: &Value) -> Result<Value, MetaError> {
        let url = self.url(method);
        debug!("Making request to url {} with data {}", url, body);
        self.request(|| self.http.post(url.as_str()).headers(self.auth.clone()).json(body))
    }

    fn url(&self, method: &str) -> String {
        format!("{}/client/{}", self.base_url, method)
    }

    fn request<F: Fn() -> RequestBuilder>(&self, build: F) -> Result<Value, MetaError> {
        let mut tries = 0;
        loop {
            tries += 1;
            match build().send() {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 && tries < RETRY_COUNT {
                        thread::sleep(backoff(tries));
                        continue
                    }
                    if !status.is_success() {
                        warn!("Metaserver returned status {}", status);
                        return Err(MetaError::Status(status.as_u16()))
                    }
                    let json: Value = response.json()?;
                    return parse_envelope(json)
                }
                Err(err) => {
                    if (err.is_connect() || err.is_timeout()) && tries < RETRY_COUNT {
                        debug!("Request failed ({}), retrying", err);
                        thread::sleep(backoff(tries));
                        continue
                    }
                    return Err(MetaError::Transport(err))
                }
            }
        }
    }
}

fn backoff(tries: u32) -> Duration {
    Duration::from_millis((backoff_seconds(tries) * 1000.0) as u64)
}

fn backoff_seconds(tries: u32) -> f64 {
    let exponent = tries.saturating_sub(1).min(16);
    (BACKOFF_FACTOR * (1u64 << exponent) as f64).min(BACKOFF_MAX)
}

fn parse_envelope(json: Value) -> Result<Value, MetaError> {
    if let Some(code) = json.get("error").and_then(Value::as_i64) {
        let message = json.get("error_message").and_then(Value::as_str).unwrap_or("?").to_string();
        debug!("API error {} {} (in many cases API errors are expected)", code, message);
        return Err(MetaError::Remote(code, message))
    }
    Ok(json)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        assert_eq!(backoff_seconds(1), 0.1);
        assert_eq!(backoff_seconds(2), 0.2);
        assert_eq!(backoff_seconds(3), 0.4);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_seconds(5), 1.0);
        assert_eq!(backoff_seconds(120), 1.0);
    }

    #[test]
    fn test_envelope_success_passes_payload() {
        let payload = parse_envelope(json!({"inode": 7})).unwrap();
        assert_eq!(payload["inode"], json!(7));
    }

    #[test]
    fn test_envelope_error_code() {
        match parse_envelope(json!({"error": 22, "error_message": "no such inode"})) {
            Err(MetaError::Remote(22, ref message)) => assert_eq!(message, "no such inode"),
            other => panic!("unexpected result: {:?}", other)
        }
    }

    #[test]
    fn test_envelope_error_without_message() {
        match parse_envelope(json!({"error": 9})) {
            Err(MetaError::Remote(9, ref message)) => assert_eq!(message, "?"),
            other => panic!("unexpected result: {:?}", other)
        }
    }
}

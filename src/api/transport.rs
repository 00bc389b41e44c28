//! The `(method, path, body?) -> JSON` request function the cache consumes.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ApiConfig, Config};
use crate::error::ApiError;

/// Sends one JSON request and returns the decoded body.
///
/// Non-2xx responses fail with [`ApiError::Server`]; requests that never
/// complete fail with [`ApiError::Network`]. A 2xx body that is not JSON is
/// returned as a string value; an empty one as `Null`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError>;
}

/// reqwest-backed transport against the Vibely REST API.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    // Url::join drops the last path segment unless the base ends with '/'
    let mut base = config.base_url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let token = Config::get_token();
    if token.is_none() {
      debug!("No API token set, requests are anonymous");
    }

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn url(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| ApiError::Network(format!("invalid request path {}: {}", path, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
    let url = self.url(path)?;
    debug!("{} {}", method, url);

    let mut request = self.client.request(method.clone(), url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = &body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(|e| {
      warn!("{} {} failed: {}", method, path, e);
      ApiError::Network(e.to_string())
    })?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| ApiError::Network(format!("failed to read response body: {}", e)))?;

    if !status.is_success() {
      warn!("{} {} returned {}", method, path, status);
      return Err(ApiError::Server {
        status: status.as_u16(),
        message: error_message(&text),
      });
    }

    Ok(parse_body(&text))
  }
}

/// Decode a 2xx body. Anything that isn't JSON is kept as a string.
fn parse_body(text: &str) -> Value {
  if text.trim().is_empty() {
    return Value::Null;
  }
  serde_json::from_str(text).unwrap_or_else(|_| {
    debug!("Response body is not JSON, keeping it as text");
    Value::String(text.to_string())
  })
}

/// Pull a human-readable message out of an error body.
///
/// Prefers a JSON `message` or `error` field, then the raw text.
fn error_message(text: &str) -> String {
  const MAX_LEN: usize = 200;

  if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
    for field in ["message", "error"] {
      if let Some(msg) = obj.get(field).and_then(|v| v.as_str()) {
        return msg.to_string();
      }
    }
  }

  let text = text.trim();
  if text.chars().count() > MAX_LEN {
    let truncated: String = text.chars().take(MAX_LEN).collect();
    format!("{}...", truncated)
  } else {
    text.to_string()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_message_prefers_json_fields() {
    assert_eq!(error_message(r#"{"message":"Post not found"}"#), "Post not found");
    assert_eq!(error_message(r#"{"error":"Forbidden"}"#), "Forbidden");
    assert_eq!(error_message("  Bad Gateway \n"), "Bad Gateway");
    assert_eq!(error_message(&"x".repeat(300)).len(), 203);
  }

  #[test]
  fn test_parse_body_is_lenient() {
    assert_eq!(parse_body(""), Value::Null);
    assert_eq!(parse_body(r#"{"ok":true}"#), serde_json::json!({"ok": true}));
    assert_eq!(parse_body("OK"), Value::String("OK".to_string()));
  }

  #[test]
  fn test_base_url_without_trailing_slash_keeps_path() {
    let config = ApiConfig {
      base_url: "https://vibely.example/api/v1".to_string(),
      ..ApiConfig::default()
    };
    let transport = HttpTransport::new(&config).unwrap();
    assert_eq!(
      transport.url("/posts/1/comments").unwrap().as_str(),
      "https://vibely.example/api/v1/posts/1/comments"
    );
    // Encoded ids stay inside their segment
    assert_eq!(
      transport.url("/comments/..%2Fadmin").unwrap().as_str(),
      "https://vibely.example/api/v1/comments/..%2Fadmin"
    );
  }
}

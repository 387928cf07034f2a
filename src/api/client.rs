use futures::future::BoxFuture;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{ApiGateway, Collection, CREATE_TRANSACTION};
use crate::cache::CacheKey;
use crate::config::{ApiConfig, ConfigSource};
use crate::error::{ApiError, ApiErrorBody};

/// HTTP implementation of [`ApiGateway`].
///
/// Credentials are read from the config source on every request, so
/// settings changes take effect without rebuilding the gateway.
#[derive(Clone)]
pub struct HttpGateway {
  http: reqwest::Client,
  config: Arc<dyn ConfigSource>,
}

impl HttpGateway {
  /// Every request, including reading the body, is bounded by `timeout`.
  pub fn new(config: Arc<dyn ConfigSource>, timeout: Duration) -> Self {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .unwrap_or_else(|e| {
        warn!(error = %e, "HTTP client setup failed, requests are unbounded");
        reqwest::Client::new()
      });
    Self { http, config }
  }

  fn credentials(&self) -> Result<ApiConfig, ApiError> {
    self
      .config
      .api_config()
      .ok_or_else(|| ApiError::Network("no API token configured".to_string()))
  }

  fn request(
    &self,
    config: &ApiConfig,
    method: Method,
    path: &str,
    query: &[(String, String)],
  ) -> Result<RequestBuilder, ApiError> {
    let url = build_url(&config.backend_url, path, query)?;
    Ok(
      self
        .http
        .request(method, url)
        .header("Content-Type", "application/json")
        .header("X-Api-Key", &config.api_token),
    )
  }
}

impl ApiGateway for HttpGateway {
  fn fetch_resource(&self, key: &CacheKey) -> BoxFuture<'static, Result<Collection, ApiError>> {
    let resource = key.resource().to_string();
    let query: Vec<(String, String)> = key
      .params()
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    let request = self.credentials().and_then(|config| {
      self.request(
        &config,
        Method::GET,
        &format!("/api/v1/{}", resource),
        &query,
      )
    });

    Box::pin(async move {
      let body = send(request?).await?;
      extract_collection(&resource, body)
    })
  }

  fn submit_mutation(
    &self,
    name: &str,
    payload: &Value,
  ) -> BoxFuture<'static, Result<Value, ApiError>> {
    let request = mutation_route(name)
      .ok_or_else(|| ApiError::UnknownMutation(name.to_string()))
      .and_then(|(path, envelope)| {
        let config = self.credentials()?;
        let builder = self.request(&config, Method::POST, path, &[])?;
        Ok(builder.json(&json!({ envelope: payload })))
      });

    Box::pin(async move { send(request?).await })
  }

  fn probe(&self) -> BoxFuture<'static, Result<(), ApiError>> {
    let request = self.credentials().and_then(|config| {
      self.request(
        &config,
        Method::GET,
        "/api/v1/accounts",
        &[("per_page".to_string(), "1".to_string())],
      )
    });

    Box::pin(async move {
      let response = request?.send().await.map_err(transport_error)?;
      debug!(status = response.status().as_u16(), "Probe answered");
      Ok(())
    })
  }
}

/// Endpoint path and body envelope for a named mutation.
fn mutation_route(name: &str) -> Option<(&'static str, &'static str)> {
  match name {
    CREATE_TRANSACTION => Some(("/api/v1/transactions", "transaction")),
    _ => None,
  }
}

fn build_url(base: &str, path: &str, query: &[(String, String)]) -> Result<Url, ApiError> {
  let base = base.trim_end_matches('/');
  let mut url = Url::parse(&format!("{}{}", base, path))
    .map_err(|e| ApiError::Network(format!("invalid backend URL '{}': {}", base, e)))?;
  if !query.is_empty() {
    url.query_pairs_mut().extend_pairs(query);
  }
  Ok(url)
}

fn transport_error(err: reqwest::Error) -> ApiError {
  if err.is_timeout() {
    ApiError::Timeout
  } else {
    ApiError::Network(err.to_string())
  }
}

async fn send(request: RequestBuilder) -> Result<Value, ApiError> {
  let response = request.send().await.map_err(transport_error)?;
  let status = response.status();

  if !status.is_success() {
    let fallback = status.canonical_reason().unwrap_or("request failed");
    let body = error_body(response.json::<Value>().await.ok(), fallback);
    return Err(ApiError::from_status(status.as_u16(), body));
  }

  response
    .json::<Value>()
    .await
    .map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

/// Decode a failure body. Bodies that are missing, malformed or carry
/// neither `error` nor `message` get `fallback` as their error.
fn error_body(raw: Option<Value>, fallback: &str) -> ApiErrorBody {
  let mut body = raw
    .and_then(|value| serde_json::from_value::<ApiErrorBody>(value).ok())
    .unwrap_or_default();
  if body.display_message().is_empty() {
    body.error = fallback.to_string();
  }
  body
}

/// List endpoints either return a bare array or wrap it under the resource
/// name next to pagination metadata.
fn extract_collection(resource: &str, body: Value) -> Result<Collection, ApiError> {
  match body {
    Value::Array(items) => Ok(items),
    Value::Object(mut map) => match map.remove(resource) {
      Some(Value::Array(items)) => Ok(items),
      _ => Err(ApiError::InvalidResponse(format!(
        "response has no '{}' list",
        resource
      ))),
    },
    _ => Err(ApiError::InvalidResponse(
      "expected a JSON list or object".to_string(),
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_build_url_strips_trailing_slashes() {
    let url = build_url("https://sure.test///", "/api/v1/tags", &[]).unwrap();
    assert_eq!(url.as_str(), "https://sure.test/api/v1/tags");
  }

  #[test]
  fn test_build_url_encodes_query() {
    let query = vec![
      ("classification".to_string(), "expense".to_string()),
      ("per_page".to_string(), "100".to_string()),
    ];
    let url = build_url("https://sure.test", "/api/v1/categories", &query).unwrap();
    assert_eq!(
      url.as_str(),
      "https://sure.test/api/v1/categories?classification=expense&per_page=100"
    );
  }

  #[test]
  fn test_build_url_rejects_empty_base() {
    assert!(matches!(
      build_url("", "/api/v1/tags", &[]),
      Err(ApiError::Network(_))
    ));
  }

  #[test]
  fn test_extract_wrapped_collection() {
    let body = json!({
      "transactions": [{"id": "t1"}, {"id": "t2"}],
      "pagination": {"page": 1, "per_page": 100, "total_count": 2, "total_pages": 1}
    });
    let items = extract_collection("transactions", body).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], "t1");
  }

  #[test]
  fn test_extract_bare_array() {
    let items = extract_collection("tags", json!([{"id": "tag-1"}])).unwrap();
    assert_eq!(items.len(), 1);
  }

  #[test]
  fn test_extract_missing_list() {
    let err = extract_collection("accounts", json!({"pagination": {}})).unwrap_err();
    assert!(matches!(err, ApiError::InvalidResponse(_)));
  }

  #[test]
  fn test_error_body_with_message_only() {
    let body = error_body(
      Some(json!({"message": "Amount is too large"})),
      "Unprocessable Entity",
    );
    assert_eq!(body.display_message(), "Amount is too large");

    let err = ApiError::from_status(422, body);
    assert_eq!(err.to_string(), "Amount is too large");
  }

  #[test]
  fn test_error_body_falls_back_to_status_reason() {
    let empty = error_body(None, "Bad Request");
    assert_eq!(empty.display_message(), "Bad Request");

    let blank = error_body(Some(json!({"error": "", "details": ["x"]})), "Bad Request");
    assert_eq!(blank.display_message(), "Bad Request");
    assert_eq!(blank.details, Some(json!(["x"])));

    let not_an_object = error_body(Some(json!("oops")), "Bad Gateway");
    assert_eq!(not_an_object.display_message(), "Bad Gateway");
  }

  #[test]
  fn test_error_body_keeps_backend_error() {
    let body = error_body(Some(json!({"error": "record_invalid"})), "Unprocessable Entity");
    assert_eq!(body.display_message(), "record_invalid");
  }

  #[test]
  fn test_mutation_route() {
    assert_eq!(
      mutation_route(CREATE_TRANSACTION),
      Some(("/api/v1/transactions", "transaction"))
    );
    assert_eq!(mutation_route("transactions.delete"), None);
  }
}

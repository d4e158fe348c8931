//! Network fetchers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use larder_common::HttpConfig;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;

/// Executes the request behind an endpoint.
///
/// Called from tasks spawned by the cache middleware, never from inside a
/// dispatch.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn execute(&self, endpoint: &str, args: &Value) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn execute(&self, endpoint: &str, args: &Value) -> Result<Value, FetchError> {
        (**self).execute(endpoint, args).await
    }
}

#[derive(Debug, Clone)]
struct Route {
    method: Method,
    path: String,
}

/// JSON-over-HTTP fetcher driven by a route table.
///
/// Each endpoint maps to a method and a path template. `{field}` segments
/// are filled from the matching field of the args object; the remaining
/// fields become query parameters for GET and DELETE, and the JSON body
/// otherwise.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    routes: HashMap<String, Route>,
    bearer: RwLock<Option<String>>,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            routes: HashMap::new(),
            bearer: RwLock::new(None),
        }
    }

    pub fn from_config(config: &HttpConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        let base_url = config.base_url.clone().unwrap_or_default();
        Ok(Self::new(client, base_url))
    }

    pub fn route(mut self, endpoint: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        self.routes.insert(
            endpoint.into(),
            Route {
                method,
                path: path.into(),
            },
        );
        self
    }

    pub fn get(self, endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        self.route(endpoint, Method::GET, path)
    }

    pub fn post(self, endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        self.route(endpoint, Method::POST, path)
    }

    pub fn patch(self, endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        self.route(endpoint, Method::PATCH, path)
    }

    pub fn delete(self, endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        self.route(endpoint, Method::DELETE, path)
    }

    /// Sent as `Authorization: Bearer <token>` on every later request.
    pub fn set_bearer_token(&self, token: Option<String>) {
        let mut bearer = self.bearer.write().unwrap_or_else(|e| e.into_inner());
        *bearer = token;
    }

    fn bearer_token(&self) -> Option<String> {
        self.bearer.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn execute(&self, endpoint: &str, args: &Value) -> Result<Value, FetchError> {
        let route = self
            .routes
            .get(endpoint)
            .ok_or_else(|| FetchError::UnknownEndpoint {
                endpoint: endpoint.to_string(),
            })?;
        let (path, rest) = render_path(&route.path, args)?;
        let url = format!("{}{}", self.base_url, path);
        debug!(endpoint, method = %route.method, url = url.as_str(), "Fetching");

        let mut request = self.client.request(route.method.clone(), &url);
        if let Some(token) = self.bearer_token() {
            request = request.bearer_auth(token);
        }
        if let Some(rest) = rest {
            request = if route.method == Method::GET || route.method == Method::DELETE {
                request.query(&query_pairs(&rest))
            } else {
                request.json(&rest)
            };
        }

        let resp = request.send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network {
                    message: err.to_string(),
                }
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|err| FetchError::Network {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| FetchError::Decode {
            message: err.to_string(),
        })
    }
}

/// Fill `{field}` placeholders from `args`. Returns the path and whatever
/// args were not consumed (`None` when nothing is left to send).
fn render_path(template: &str, args: &Value) -> Result<(String, Option<Value>), FetchError> {
    let mut remaining = match args {
        Value::Object(map) => Some(map.clone()),
        _ => None,
    };
    let mut path = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let close = rest[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| FetchError::InvalidArgs {
                message: format!("unterminated placeholder in `{template}`"),
            })?;
        let field = &rest[open + 1..close];
        let value = remaining
            .as_mut()
            .and_then(|map| map.remove(field))
            .ok_or_else(|| FetchError::InvalidArgs {
                message: format!("missing `{field}` for path `{template}`"),
            })?;
        path.push_str(&rest[..open]);
        match value {
            Value::String(s) => path.push_str(&encode_segment(&s)),
            other => path.push_str(&encode_segment(&other.to_string())),
        }
        rest = &rest[close + 1..];
    }
    path.push_str(rest);

    let leftover = match remaining {
        Some(map) if map.is_empty() => None,
        Some(map) => Some(Value::Object(map)),
        None if args.is_null() => None,
        None => Some(args.clone()),
    };
    Ok((path, leftover))
}

/// Percent-encode `raw` as a single path segment, so `/`, `?` and `#`
/// cannot change the route.
fn encode_segment(raw: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse("http://segment.invalid/") else {
        return raw.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(raw);
    }
    url.path().trim_start_matches('/').to_string()
}

fn query_pairs(args: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = args else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

//! Outbound HTTP calls to containers: request construction from declared
//! argument locations, the reqwest transport, and bounded retry on resets.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::coerce::stringify;
use crate::config::EngineConfig;
use crate::error::{ExecError, Result};
use crate::models::{Argument, Http, Location, Method};

// Upper bound for the doubling backoff between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// The peer dropped the connection; worth sending the same request again.
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Builds the request for `http` against a container reachable on `external_port`.
///
/// Each argument goes to the URL path, the query string or the JSON body
/// according to its declared location.
pub fn build_request(
    http: &Http,
    external_port: u16,
    declared: &[Argument],
    args: &Map<String, Value>,
) -> Result<HttpRequest> {
    let mut path = http.path.clone();
    let mut query = Vec::new();
    let mut body = Map::new();
    for arg in declared {
        let Some(value) = args.get(&arg.name) else {
            continue;
        };
        match arg.location {
            Some(Location::Path) => {
                path = path.replace(&format!("{{{{{}}}}}", arg.name), &stringify(value));
            }
            Some(Location::Query) => query.push((arg.name.as_str(), stringify(value))),
            Some(Location::Body) => {
                body.insert(arg.name.clone(), value.clone());
            }
            None => debug!(argument = %arg.name, "argument has no location, not sent"),
        }
    }

    let raw = format!("http://localhost:{}{}", external_port, path);
    let mut url = url::Url::parse(&raw)
        .map_err(|e| ExecError::Invocation(format!("invalid url `{}`: {}", raw, e)))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    Ok(HttpRequest {
        method: http.method,
        url: url.to_string(),
        body: (!body.is_empty()).then_some(Value::Object(body)),
    })
}

#[derive(Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut req = self.http.request(method, &request.url);
        if let Some(body) = &request.body {
            req = req.json(body);
        }
        let res = req.send().await.map_err(classify)?;
        let status = res.status().as_u16();
        let body = res.text().await.map_err(classify)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return TransportError::ConnectionReset(err.to_string());
            }
        }
        // hyper reports a peer hanging up mid-response this way
        if e.to_string().contains("connection closed before message completed") {
            return TransportError::ConnectionReset(err.to_string());
        }
        source = e.source();
    }
    TransportError::Other(err.to_string())
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Deadline for each single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.request_attempts.max(1),
            backoff: config.retry_backoff,
            timeout: config.request_timeout,
        }
    }
}

/// Sends requests, repeating one that failed with a connection reset up to
/// the policy's attempt bound. Every other failure is returned at once.
#[derive(Clone)]
pub struct RequestRetrier {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RequestRetrier {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut delay = self.policy.backoff;
        let mut last = String::new();
        for attempt in 1..=self.policy.max_attempts {
            debug!(attempt, method = request.method.as_str(), url = %request.url, "sending request");
            let outcome = tokio::time::timeout(self.policy.timeout, self.transport.send(request)).await;
            match outcome {
                Ok(Ok(res)) if res.is_success() => return Ok(res),
                Ok(Ok(res)) => {
                    return Err(ExecError::HttpStatus {
                        status: res.status,
                        body: res.body.trim().to_string(),
                    })
                }
                Ok(Err(TransportError::ConnectionReset(msg))) => {
                    warn!(attempt, url = %request.url, "connection reset: {}", msg);
                    last = msg;
                }
                Ok(Err(TransportError::Timeout)) | Err(_) => {
                    return Err(ExecError::Timeout {
                        during: format!("waiting for {}", request.url),
                        secs: self.policy.timeout.as_secs(),
                    })
                }
                Ok(Err(TransportError::Other(msg))) => return Err(ExecError::Invocation(msg)),
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
        Err(ExecError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last,
        })
    }
}

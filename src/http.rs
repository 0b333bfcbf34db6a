use std::thread;
use std::time::Duration;

use rand::Rng;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }

    pub fn message(&self) -> &str {
        match self {
            TransportError::Timeout(message)
            | TransportError::Connect(message)
            | TransportError::Other(message) => message,
        }
    }
}

pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<F> Transport for F
where
    F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync,
{
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self(request)
    }
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, DispatchError> {
        Self::with_headers(&[])
    }

    pub fn with_headers(extra: &[(&str, &str)]) -> Result<Self, DispatchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("oryza-dispatch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DispatchError::Config(err.to_string()))?,
        );
        for (name, value) in extra {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| DispatchError::Config(err.to_string()))?;
            let mut value =
                HeaderValue::from_str(value).map_err(|err| DispatchError::Config(err.to_string()))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| DispatchError::Config(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential delay before retry `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_with_jitter(&self, attempt: usize) -> Duration {
        let delay = self.backoff(attempt);
        let spread = (delay.as_millis() / 4) as u64;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Stateless wrapper applying [`RetryPolicy`] to every call of one external service.
#[derive(Clone)]
pub struct RetryClient<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    service: &'static str,
}

impl<T: Transport> RetryClient<T> {
    pub fn new(service: &'static str, transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            service,
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn call(&self, request: &HttpRequest) -> Result<HttpResponse, DispatchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let failure = match self.transport.send(request) {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if is_retryable_status(response.status) => {
                    (Some(response.status), response.body)
                }
                Ok(response) => {
                    return Err(DispatchError::ClientRequest {
                        service: self.service,
                        status: response.status,
                        message: response.body,
                    });
                }
                Err(err) if err.is_retryable() => (None, err.message().to_string()),
                Err(err) => {
                    return Err(DispatchError::ExternalService {
                        service: self.service,
                        attempts: attempt,
                        status: None,
                        message: err.message().to_string(),
                    });
                }
            };

            if attempt >= max_attempts {
                let (status, body) = failure;
                let message = match status {
                    Some(code) if body.trim().is_empty() => format!("status {code}"),
                    Some(code) => format!("status {code}: {}", body.trim()),
                    None => body,
                };
                return Err(DispatchError::ExternalService {
                    service: self.service,
                    attempts: attempt,
                    status,
                    message,
                });
            }

            let delay = self.policy.delay_with_jitter(attempt - 1);
            tracing::debug!(
                service = self.service,
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            );
            thread::sleep(delay);
        }
    }

    pub fn call_json<D: DeserializeOwned>(&self, request: &HttpRequest) -> Result<D, DispatchError> {
        let response = self.call(request)?;
        serde_json::from_str(&response.body).map_err(|err| DispatchError::UnexpectedPayload {
            service: self.service,
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    fn scripted(
        responses: Vec<Result<HttpResponse, TransportError>>,
    ) -> impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync {
        let queue = Mutex::new(responses.into_iter());
        move |_request: &HttpRequest| {
            queue
                .lock()
                .unwrap()
                .next()
                .unwrap_or_else(|| Ok(HttpResponse::new(500, "script exhausted")))
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(1),
        };
        for _ in 0..50 {
            let delay = policy.delay_with_jitter(0);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn retries_transient_status_then_succeeds() {
        let client = RetryClient::new(
            "test",
            scripted(vec![
                Ok(HttpResponse::new(503, "busy")),
                Ok(HttpResponse::new(503, "busy")),
                Ok(HttpResponse::new(200, "ok")),
            ]),
            RetryPolicy::immediate(3),
        );
        let response = client.call(&HttpRequest::get("http://x.test")).unwrap();
        assert_eq!(response.body, "ok");
    }

    #[test]
    fn exhausted_budget_reports_last_status() {
        let client = RetryClient::new(
            "test",
            scripted(vec![
                Ok(HttpResponse::new(503, "busy")),
                Ok(HttpResponse::new(429, "slow down")),
            ]),
            RetryPolicy::immediate(2),
        );
        let err = client.call(&HttpRequest::get("http://x.test")).unwrap_err();
        assert_matches!(
            err,
            DispatchError::ExternalService {
                attempts: 2,
                status: Some(429),
                ..
            }
        );
    }

    #[test]
    fn client_errors_are_not_retried() {
        let calls = Mutex::new(0usize);
        let transport = |_request: &HttpRequest| -> Result<HttpResponse, TransportError> {
            *calls.lock().unwrap() += 1;
            Ok(HttpResponse::new(404, "no such run"))
        };
        let client = RetryClient::new("test", &transport, RetryPolicy::immediate(5));
        let err = client.call(&HttpRequest::get("http://x.test")).unwrap_err();
        assert_matches!(err, DispatchError::ClientRequest { status: 404, .. });
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn connection_failures_are_retried() {
        let client = RetryClient::new(
            "test",
            scripted(vec![
                Err(TransportError::Connect("refused".to_string())),
                Err(TransportError::Timeout("timed out".to_string())),
                Ok(HttpResponse::new(200, "{\"id\":\"a\"}")),
            ]),
            RetryPolicy::immediate(3),
        );
        let value: Value = client.call_json(&HttpRequest::get("http://x.test")).unwrap();
        assert_eq!(value["id"], "a");
    }
}

use crate::error::ApiError;
use crate::io::{HttpRunner, Response};
use crate::time::Milliseconds;
use crate::{log_debug, Result};
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap};
use std::fmt::{self, Display, Formatter};

pub mod throttle;

/// Blocking HTTP runner backed by a shared `ureq` agent. Statuses >= 400 are
/// returned as responses so the retry layer and the response interceptors
/// can inspect them.
pub struct HttpClient {
    agent: ureq::Agent,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        HttpClient {
            agent: config.into(),
        }
    }

    fn into_response(
        result: std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error>,
    ) -> Result<Response> {
        let mut response = result.map_err(transport_error)?;
        let status = response.status().as_u16();
        // Grab headers, lowercased, for the interceptors and callers.
        let headers = response
            .headers()
            .iter()
            .fold(Headers::new(), |mut headers, (name, value)| {
                if let Ok(value) = value.to_str() {
                    headers.set(name.as_str(), value);
                }
                headers
            });
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(transport_error)?;
        let response = Response::builder()
            .status(status)
            .body(body)
            .headers(headers)
            .build()?;
        Ok(response)
    }
}

fn with_headers<B>(req: ureq::RequestBuilder<B>, headers: &Headers) -> ureq::RequestBuilder<B> {
    headers
        .iter()
        .fold(req, |req, (key, value)| req.header(key.as_str(), value.as_str()))
}

fn transport_error(err: ureq::Error) -> anyhow::Error {
    match err {
        err @ ureq::Error::Timeout(_) => ApiError::Timeout(err.to_string()).into(),
        err => ApiError::Transport(err.to_string()).into(),
    }
}

impl HttpRunner for HttpClient {
    fn run(&self, request: &Request) -> Result<Response> {
        // zero disables the socket timeout
        let timeout = request
            .timeout()
            .filter(|timeout| **timeout > 0)
            .map(|timeout| timeout.as_duration());
        log_debug!("{} {}", request.method(), request.url());
        let result = match request.method() {
            Method::GET => with_headers(self.agent.get(request.url()), request.headers())
                .config()
                .timeout_global(timeout)
                .build()
                .call(),
            Method::DELETE => with_headers(self.agent.delete(request.url()), request.headers())
                .config()
                .timeout_global(timeout)
                .build()
                .call(),
            Method::POST | Method::PUT | Method::PATCH => {
                let req = match request.method() {
                    Method::POST => self.agent.post(request.url()),
                    Method::PUT => self.agent.put(request.url()),
                    _ => self.agent.patch(request.url()),
                };
                let req = with_headers(req, request.headers())
                    .config()
                    .timeout_global(timeout)
                    .build();
                match request.body() {
                    Some(body) => req.send(body),
                    None => req.send_empty(),
                }
            }
        };
        Self::into_response(result)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::PATCH => "PATCH",
            Method::DELETE => "DELETE",
        }
    }

    /// Only side-effect free requests participate in caching and
    /// deduplication.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::GET)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Method {
    type Error = ApiError;

    fn try_from(method: &str) -> std::result::Result<Self, Self::Error> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "PATCH" => Ok(Method::PATCH),
            "DELETE" => Ok(Method::DELETE),
            _ => Err(ApiError::ApplicationError(format!(
                "Unsupported HTTP method: {method}"
            ))),
        }
    }
}

/// Request and response headers. Names are stored lowercased so lookups are
/// case-insensitive and iteration order is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Headers(BTreeMap::new())
    }

    pub fn set<K: AsRef<str>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.as_ref().to_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(&key.to_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_lowercase())
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every header from `other`, overriding existing values.
    pub fn extend(&mut self, other: &Headers) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(pattern = "owned")]
pub struct Request {
    #[builder(default)]
    method: Method,
    #[builder(setter(into))]
    url: String,
    #[builder(default)]
    headers: Headers,
    #[builder(setter(into, strip_option), default)]
    body: Option<String>,
    /// Per-attempt timeout.
    #[builder(setter(into, strip_option), default)]
    timeout: Option<Milliseconds>,
    #[builder(setter(into, strip_option), default)]
    retries: Option<u32>,
    #[builder(setter(into, strip_option), default)]
    retry_delay: Option<Milliseconds>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn new(url: &str, method: Method) -> Self {
        Request {
            method,
            url: url.to_string(),
            headers: Headers::new(),
            body: None,
            timeout: None,
            retries: None,
            retry_delay: None,
        }
    }

    pub fn with_body<B: Into<String>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.set(key, value);
    }

    pub fn set_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn timeout(&self) -> Option<Milliseconds> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Milliseconds) {
        self.timeout = Some(timeout);
    }

    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.retries = Some(retries);
    }

    pub fn retry_delay(&self) -> Option<Milliseconds> {
        self.retry_delay
    }

    pub fn set_retry_delay(&mut self, retry_delay: Milliseconds) {
        self.retry_delay = Some(retry_delay);
    }
}

//! Client façade. Composes the interceptor pipeline, the request cache and
//! the retrying transport behind verb methods.
//!
//! Flow of a call: request interceptors, then for cacheable requests the
//! cache (which runs the fetch at most once per key at a time), the
//! transport, response interceptors, and finally the status check. Values
//! are cached only after the status check passed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api_defaults::{
    CONTENT_TYPE_JSON, DEFAULT_CACHE_DURATION_MILLISECONDS, DEFAULT_CACHE_KEY_HEADERS,
    DEFAULT_CACHE_SWEEP_INTERVAL_MILLISECONDS, DEFAULT_METRICS_RETENTION_MILLISECONDS,
    DEFAULT_METRICS_SWEEP_INTERVAL_MILLISECONDS, DEFAULT_RETRIES,
    DEFAULT_RETRY_DELAY_MILLISECONDS, DEFAULT_TIMEOUT_MILLISECONDS,
    FAST_CACHE_DURATION_MILLISECONDS, FAST_RETRIES, FAST_TIMEOUT_MILLISECONDS, LOGIN_ROUTE,
    SLOW_CACHE_DURATION_MILLISECONDS, SLOW_RETRIES, SLOW_TIMEOUT_MILLISECONDS,
};
use crate::backoff::RetryPolicy;
use crate::cache::{cache_key, RequestCache};
use crate::error::{AddContext, ApiError};
use crate::http::throttle::{DynamicFixed, Throttle};
use crate::http::{Headers, HttpClient, Method, Request};
use crate::interceptor::{
    AuthInterceptor, EffectHandler, IgnoreEffects, Intercepted, InterceptorPipeline,
    RequestInterceptor, ResponseInterceptor, UnauthorizedInterceptor,
};
use crate::io::{HttpRunner, Response};
use crate::metrics::{MetricsSummary, PerformanceMetrics, PerformanceSample};
use crate::registry::ActiveRequests;
use crate::session::Session;
use crate::time::{Clock, Milliseconds, SystemClock};
use crate::transport::RetryingTransport;
use crate::{lock, log_debug, log_error, log_info, Result};

#[derive(Builder, Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Prefix for relative paths. Absolute URLs are used as given.
    #[builder(setter(into), default)]
    pub base_url: String,
    #[builder(setter(into), default = "Milliseconds::new(DEFAULT_TIMEOUT_MILLISECONDS)")]
    pub timeout: Milliseconds,
    #[builder(default = "DEFAULT_RETRIES")]
    pub retries: u32,
    #[builder(
        setter(into),
        default = "Milliseconds::new(DEFAULT_RETRY_DELAY_MILLISECONDS)"
    )]
    pub retry_delay: Milliseconds,
    #[builder(setter(into), default)]
    pub jitter: Milliseconds,
    #[builder(default = "true")]
    pub cache_enabled: bool,
    #[builder(
        setter(into),
        default = "Milliseconds::new(DEFAULT_CACHE_DURATION_MILLISECONDS)"
    )]
    pub cache_duration: Milliseconds,
    /// Zero disables the background sweep.
    #[builder(
        setter(into),
        default = "Milliseconds::new(DEFAULT_CACHE_SWEEP_INTERVAL_MILLISECONDS)"
    )]
    pub cache_sweep_interval: Milliseconds,
    #[builder(
        setter(into),
        default = "Milliseconds::new(DEFAULT_METRICS_RETENTION_MILLISECONDS)"
    )]
    pub metrics_retention: Milliseconds,
    #[builder(
        setter(into),
        default = "Milliseconds::new(DEFAULT_METRICS_SWEEP_INTERVAL_MILLISECONDS)"
    )]
    pub metrics_sweep_interval: Milliseconds,
    #[builder(default = "default_cache_key_headers()")]
    pub cache_key_headers: Vec<String>,
    /// Where a 401 sends the host when a session is attached.
    #[builder(setter(into), default = "LOGIN_ROUTE.to_string()")]
    pub login_route: String,
}

fn default_cache_key_headers() -> Vec<String> {
    DEFAULT_CACHE_KEY_HEADERS
        .iter()
        .map(|header| header.to_string())
        .collect()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    fn profile(timeout: u64, retries: u32, cache_duration: u64) -> Self {
        ClientConfig {
            base_url: String::new(),
            timeout: Milliseconds::new(timeout),
            retries,
            retry_delay: Milliseconds::new(DEFAULT_RETRY_DELAY_MILLISECONDS),
            jitter: Milliseconds::default(),
            cache_enabled: true,
            cache_duration: Milliseconds::new(cache_duration),
            cache_sweep_interval: Milliseconds::new(DEFAULT_CACHE_SWEEP_INTERVAL_MILLISECONDS),
            metrics_retention: Milliseconds::new(DEFAULT_METRICS_RETENTION_MILLISECONDS),
            metrics_sweep_interval: Milliseconds::new(DEFAULT_METRICS_SWEEP_INTERVAL_MILLISECONDS),
            cache_key_headers: default_cache_key_headers(),
            login_route: LOGIN_ROUTE.to_string(),
        }
    }

    /// Frequently changing data: short timeout and cache lifetime.
    pub fn fast() -> Self {
        Self::profile(
            FAST_TIMEOUT_MILLISECONDS,
            FAST_RETRIES,
            FAST_CACHE_DURATION_MILLISECONDS,
        )
    }

    pub fn standard() -> Self {
        Self::profile(
            DEFAULT_TIMEOUT_MILLISECONDS,
            DEFAULT_RETRIES,
            DEFAULT_CACHE_DURATION_MILLISECONDS,
        )
    }

    /// Reference data that rarely changes.
    pub fn slow() -> Self {
        Self::profile(
            SLOW_TIMEOUT_MILLISECONDS,
            SLOW_RETRIES,
            SLOW_CACHE_DURATION_MILLISECONDS,
        )
    }

    pub fn by_name(profile: &str) -> Option<Self> {
        match profile {
            "fast" => Some(Self::fast()),
            "standard" => Some(Self::standard()),
            "slow" => Some(Self::slow()),
            _ => None,
        }
    }

    pub fn with_base_url(self, base_url: &str) -> Self {
        ClientConfig {
            base_url: base_url.to_string(),
            ..self
        }
    }
}

/// Per-call overrides.
#[derive(Builder, Clone, Debug, Default, PartialEq)]
#[builder(default)]
pub struct RequestOptions {
    /// Merged over the default headers; caller values win.
    pub headers: Headers,
    #[builder(setter(into, strip_option))]
    pub timeout: Option<Milliseconds>,
    #[builder(setter(into, strip_option))]
    pub retries: Option<u32>,
    #[builder(setter(into, strip_option))]
    pub retry_delay: Option<Milliseconds>,
    #[builder(setter(into, strip_option))]
    pub cache_duration: Option<Milliseconds>,
    /// Bypass the cache and deduplication for this call.
    pub skip_cache: bool,
}

impl RequestOptions {
    pub fn builder() -> RequestOptionsBuilder {
        RequestOptionsBuilder::default()
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.set(key, value);
        self
    }
}

/// Background thread running `sweep` every `interval` until stopped.
struct Janitor {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    fn spawn<F>(name: &str, interval: Milliseconds, sweep: F) -> Option<Janitor>
    where
        F: Fn() + Send + 'static,
    {
        if *interval == 0 {
            return None;
        }
        let (stop, signal) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match signal.recv_timeout(interval.as_duration()) {
                    Err(RecvTimeoutError::Timeout) => sweep(),
                    _ => break,
                }
            });
        match spawned {
            Ok(handle) => Some(Janitor {
                stop: Some(stop),
                handle: Some(handle),
            }),
            Err(err) => {
                log_error!("Could not start {} thread: {}", name, err);
                None
            }
        }
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the thread with a disconnect.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log_error!("Janitor thread panicked");
            }
        }
    }
}

pub struct ApiClientBuilder {
    config: ClientConfig,
    runner: Option<Arc<dyn HttpRunner>>,
    throttle: Option<Arc<dyn Throttle>>,
    clock: Option<Arc<dyn Clock>>,
    effects: Option<Arc<dyn EffectHandler>>,
    session: Option<Arc<Session>>,
}

impl ApiClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn HttpRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Receives the effects emitted by response interceptors. Defaults to
    /// the session when one is attached.
    pub fn effect_handler(mut self, effects: Arc<dyn EffectHandler>) -> Self {
        self.effects = Some(effects);
        self
    }

    /// Attach bearer tokens from `session` and log out on 401.
    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> ApiClient {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(HttpClient::new()));
        let throttle = self.throttle.unwrap_or_else(|| Arc::new(DynamicFixed));
        let effects: Arc<dyn EffectHandler> = match (self.effects, &self.session) {
            (Some(effects), _) => effects,
            (None, Some(session)) => session.clone(),
            (None, None) => Arc::new(IgnoreEffects),
        };

        let registry = Arc::new(ActiveRequests::new());
        let metrics = Arc::new(PerformanceMetrics::new(clock.clone()));
        let cache = Arc::new(RequestCache::new(clock));
        let policy = RetryPolicy::new(self.config.retries, self.config.retry_delay)
            .with_jitter(self.config.jitter);
        let transport = RetryingTransport::new(
            runner,
            registry.clone(),
            metrics.clone(),
            throttle,
            self.config.timeout,
            policy,
        );

        let interceptors = InterceptorPipeline::new();
        if let Some(session) = &self.session {
            interceptors.add_request_interceptor(AuthInterceptor::new(session.clone()));
            interceptors.add_response_interceptor(
                UnauthorizedInterceptor::new(session.navigator())
                    .with_login_route(&self.config.login_route),
            );
        }

        let janitors: Vec<Janitor> = {
            let cache = cache.clone();
            let sweep_cache = Janitor::spawn(
                "afetch-cache-sweep",
                self.config.cache_sweep_interval,
                move || {
                    cache.cleanup_expired();
                },
            );
            let metrics = metrics.clone();
            let retention = self.config.metrics_retention;
            let sweep_metrics = Janitor::spawn(
                "afetch-metrics-sweep",
                self.config.metrics_sweep_interval,
                move || {
                    metrics.purge_older_than(retention);
                },
            );
            sweep_cache.into_iter().chain(sweep_metrics).collect()
        };

        ApiClient {
            config: self.config,
            cache,
            transport,
            registry,
            metrics,
            interceptors,
            effects,
            janitors: Mutex::new(janitors),
            disposed: AtomicBool::new(false),
        }
    }
}

pub struct ApiClient {
    config: ClientConfig,
    cache: Arc<RequestCache<Response>>,
    transport: RetryingTransport,
    registry: Arc<ActiveRequests>,
    metrics: Arc<PerformanceMetrics>,
    interceptors: InterceptorPipeline,
    effects: Arc<dyn EffectHandler>,
    janitors: Mutex<Vec<Janitor>>,
    disposed: AtomicBool,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder {
            config: ClientConfig::default(),
            runner: None,
            throttle: None,
            clock: None,
            effects: None,
            session: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn get(&self, path: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::GET, path, None, options)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> Result<T> {
        self.get(path, options)?.json()
    }

    pub fn post<D: Serialize + ?Sized>(
        &self,
        path: &str,
        data: &D,
        options: RequestOptions,
    ) -> Result<Response> {
        self.request(Method::POST, path, Some(encode(data)?), options)
    }

    pub fn put<D: Serialize + ?Sized>(
        &self,
        path: &str,
        data: &D,
        options: RequestOptions,
    ) -> Result<Response> {
        self.request(Method::PUT, path, Some(encode(data)?), options)
    }

    pub fn patch<D: Serialize + ?Sized>(
        &self,
        path: &str,
        data: &D,
        options: RequestOptions,
    ) -> Result<Response> {
        self.request(Method::PATCH, path, Some(encode(data)?), options)
    }

    pub fn delete(&self, path: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::DELETE, path, None, options)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        options: RequestOptions,
    ) -> Result<Response> {
        if self.is_disposed() {
            return Err(ApiError::Aborted("client has been disposed".to_string()).into());
        }
        let url = self.url_for(path);
        let mut headers = Headers::new();
        headers.set("accept", CONTENT_TYPE_JSON);
        if body.is_some() {
            headers.set("content-type", CONTENT_TYPE_JSON);
        }
        headers.extend(&options.headers);

        let mut request = Request::new(&url, method);
        request.set_headers(headers);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        if let Some(timeout) = options.timeout {
            request.set_timeout(timeout);
        }
        if let Some(retries) = options.retries {
            request.set_retries(retries);
        }
        if let Some(retry_delay) = options.retry_delay {
            request.set_retry_delay(retry_delay);
        }
        let request = self.interceptors.apply_request(request);

        if method.is_cacheable() && self.config.cache_enabled && !options.skip_cache {
            // Keyed after the interceptors so the attached credentials take
            // part in the key.
            let key = cache_key(&request, &self.config.cache_key_headers);
            let ttl = options.cache_duration.unwrap_or(self.config.cache_duration);
            self.cache.request(&key, || self.dispatch(&request), ttl)
        } else {
            self.dispatch(&request)
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Response> {
        let response = self.transport.execute(request)?;
        let Intercepted { response, effects } = self.interceptors.apply_response(response);
        for effect in &effects {
            log_info!("Applying {:?} after {} {}", effect, request.method(), request.url());
            self.effects.apply(effect);
        }
        let response = response
            .error_for_status()
            .err_context(format!("{} {}", request.method(), request.url()))?;
        Ok(response)
    }

    fn url_for(&self, path: &str) -> String {
        let absolute = path.starts_with("http://") || path.starts_with("https://");
        if absolute || self.config.base_url.is_empty() {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn add_request_interceptor<I: RequestInterceptor + 'static>(&self, interceptor: I) {
        self.interceptors.add_request_interceptor(interceptor);
    }

    pub fn add_response_interceptor<I: ResponseInterceptor + 'static>(&self, interceptor: I) {
        self.interceptors.add_response_interceptor(interceptor);
    }

    /// Abort every call in flight, including calls waiting to retry. Aborted
    /// calls fail with `ApiError::Aborted` and are not retried.
    pub fn cancel_all_requests(&self) -> usize {
        self.registry.cancel_all()
    }

    /// Abort the calls whose id (`url:sequence`) contains `pattern`.
    pub fn cancel_requests_by_pattern(&self, pattern: &str) -> usize {
        let cancelled = self.registry.cancel_by_pattern(pattern);
        log_debug!("Cancelled {} requests matching {}", cancelled, pattern);
        cancelled
    }

    pub fn active_requests(&self) -> usize {
        self.registry.len()
    }

    pub fn performance_metrics(&self, url: Option<&str>) -> Vec<PerformanceSample> {
        self.metrics.samples(url)
    }

    pub fn metrics_summary(&self, url: Option<&str>) -> MetricsSummary {
        self.metrics.summary(url)
    }

    pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
        self.cache.clear(pattern)
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cache.cleanup_expired()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel everything in flight, drop cached values and samples and stop
    /// the background sweeps. Later calls fail with `ApiError::Aborted`.
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.close();
        self.cache.clear(None);
        self.metrics.clear();
        let mut janitors = std::mem::take(&mut *lock(&self.janitors));
        for janitor in janitors.iter_mut() {
            janitor.stop();
        }
        log_debug!("Client disposed");
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn encode<D: Serialize + ?Sized>(data: &D) -> Result<String> {
    serde_json::to_string(data)
        .map_err(|err| ApiError::SerializationError(err.to_string()))
        .err_context("Could not encode request body")
}

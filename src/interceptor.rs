//! Ordered request and response transforms applied around every call.
//!
//! Interceptors run in registration order on both paths. A failing
//! interceptor is logged and skipped: the next stage receives the value as it
//! was before the failing stage ran.
//!
//! Response interceptors never touch global state directly. Side effects such
//! as dropping a stored token or moving to the login page are returned as
//! [`Effect`] descriptors and applied by the host through an
//! [`EffectHandler`].

use std::sync::{Arc, Mutex};

use crate::api_defaults::{AUTH_TOKEN_KEY, LOGIN_ROUTE};
use crate::http::Request;
use crate::io::Response;
use crate::session::{Navigator, Session};
use crate::{lock, log_debug, log_warn, Result};

pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, url: &str, request: Request) -> Result<Request>;
}

impl<F> RequestInterceptor for F
where
    F: Fn(&str, Request) -> Result<Request> + Send + Sync,
{
    fn intercept(&self, url: &str, request: Request) -> Result<Request> {
        self(url, request)
    }
}

/// Output of a response interceptor: the transformed response plus the side
/// effects the host should apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Intercepted {
    pub response: Response,
    pub effects: Vec<Effect>,
}

impl From<Response> for Intercepted {
    fn from(response: Response) -> Self {
        Intercepted {
            response,
            effects: Vec::new(),
        }
    }
}

pub trait ResponseInterceptor: Send + Sync {
    fn intercept(&self, response: Response) -> Result<Intercepted>;
}

impl<F> ResponseInterceptor for F
where
    F: Fn(Response) -> Result<Response> + Send + Sync,
{
    fn intercept(&self, response: Response) -> Result<Intercepted> {
        self(response).map(Intercepted::from)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Remove the stored token under `key` from every token store.
    ClearToken { key: String },
    /// Navigate the host to `to`.
    Redirect { to: String },
}

pub trait EffectHandler: Send + Sync {
    fn apply(&self, effect: &Effect);
}

/// Discards every effect. Used when the client has no session attached.
pub struct IgnoreEffects;

impl EffectHandler for IgnoreEffects {
    fn apply(&self, effect: &Effect) {
        log_debug!("No effect handler installed, dropping {:?}", effect);
    }
}

#[derive(Default)]
pub struct InterceptorPipeline {
    request: Mutex<Vec<Arc<dyn RequestInterceptor>>>,
    response: Mutex<Vec<Arc<dyn ResponseInterceptor>>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request_interceptor<I: RequestInterceptor + 'static>(&self, interceptor: I) {
        lock(&self.request).push(Arc::new(interceptor));
    }

    pub fn add_response_interceptor<I: ResponseInterceptor + 'static>(&self, interceptor: I) {
        lock(&self.response).push(Arc::new(interceptor));
    }

    pub fn apply_request(&self, request: Request) -> Request {
        // Snapshot so interceptors run without holding the lock and may
        // register further interceptors.
        let interceptors = lock(&self.request).clone();
        interceptors
            .iter()
            .enumerate()
            .fold(request, |request, (index, interceptor)| {
                let url = request.url().to_string();
                match interceptor.intercept(&url, request.clone()) {
                    Ok(request) => request,
                    Err(err) => {
                        log_warn!("Request interceptor {} failed, skipping: {:#}", index, err);
                        request
                    }
                }
            })
    }

    pub fn apply_response(&self, response: Response) -> Intercepted {
        let interceptors = lock(&self.response).clone();
        interceptors.iter().enumerate().fold(
            Intercepted::from(response),
            |mut acc, (index, interceptor)| match interceptor.intercept(acc.response.clone()) {
                Ok(Intercepted { response, effects }) => {
                    acc.response = response;
                    acc.effects.extend(effects);
                    acc
                }
                Err(err) => {
                    log_warn!("Response interceptor {} failed, skipping: {:#}", index, err);
                    acc
                }
            },
        )
    }
}

/// Attaches `Authorization: Bearer <token>` when the session holds a token.
/// An explicit authorization header set by the caller is left alone.
pub struct AuthInterceptor {
    session: Arc<Session>,
}

impl AuthInterceptor {
    pub fn new(session: Arc<Session>) -> Self {
        AuthInterceptor { session }
    }
}

impl RequestInterceptor for AuthInterceptor {
    fn intercept(&self, _url: &str, mut request: Request) -> Result<Request> {
        if request.headers().contains("authorization") {
            return Ok(request);
        }
        if let Some(token) = self.session.bearer_token() {
            request.set_header("authorization", &format!("Bearer {token}"));
        }
        Ok(request)
    }
}

/// On 401 asks the host to drop the stored token and to navigate to the
/// login route, unless it is already there. The response itself is passed on
/// unchanged so the caller still sees the failure.
pub struct UnauthorizedInterceptor {
    navigator: Arc<dyn Navigator>,
    login_route: String,
    token_key: String,
}

impl UnauthorizedInterceptor {
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        UnauthorizedInterceptor {
            navigator,
            login_route: LOGIN_ROUTE.to_string(),
            token_key: AUTH_TOKEN_KEY.to_string(),
        }
    }

    pub fn with_login_route(self, login_route: &str) -> Self {
        UnauthorizedInterceptor {
            login_route: login_route.to_string(),
            ..self
        }
    }
}

impl ResponseInterceptor for UnauthorizedInterceptor {
    fn intercept(&self, response: Response) -> Result<Intercepted> {
        if response.status != 401 {
            return Ok(response.into());
        }
        let mut effects = vec![Effect::ClearToken {
            key: self.token_key.clone(),
        }];
        if self.navigator.current_route() != self.login_route {
            effects.push(Effect::Redirect {
                to: self.login_route.clone(),
            });
        }
        Ok(Intercepted { response, effects })
    }
}

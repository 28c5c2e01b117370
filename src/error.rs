use std::fmt::Display;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

/// Errors surfaced by the request layer. The enum is `Clone` so a single
/// outcome can be handed to every caller waiting on the same in-flight
/// request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("HTTP transport error: {0}")]
    Transport(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Request aborted: {0}")]
    Aborted(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Time conversion error: {0}")]
    TimeConversionError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Application error: {0}")]
    ApplicationError(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ApiError::Aborted(_))
    }

    /// Client errors (4xx) and cancellations are final. Server errors,
    /// timeouts and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::Transport(_) | ApiError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Recover the typed error from an `anyhow::Error`. Anything that did not
    /// originate here becomes an `ApplicationError` carrying the full context
    /// chain.
    pub fn from_anyhow(err: anyhow::Error) -> ApiError {
        match err.downcast::<ApiError>() {
            Ok(api_error) => api_error,
            Err(err) => ApiError::ApplicationError(format!("{err:#}")),
        }
    }

    /// Like `from_anyhow`, leaving `err` intact for its owner.
    pub fn from_anyhow_ref(err: &anyhow::Error) -> ApiError {
        match err.downcast_ref::<ApiError>() {
            Some(api_error) => api_error.clone(),
            None => ApiError::ApplicationError(format!("{err:#}")),
        }
    }
}

pub trait AddContext<T, E>: Context<T, E> {
    fn err_context<C: Display + Send + Sync + 'static>(self, msg: C) -> Result<T, anyhow::Error>
    where
        Self: Sized,
    {
        self.with_context(|| msg.to_string())
    }
}

impl<U, T, E> AddContext<T, E> for U where U: Context<T, E> {}

pub fn gen<T: AsRef<str>>(msg: T) -> anyhow::Error {
    anyhow!(msg.as_ref().to_string())
}

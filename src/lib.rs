pub mod api_defaults;
pub mod backoff;
pub mod cache;
pub mod cli;
pub mod client;
pub mod cmds;
pub mod config;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod time;
pub mod transport;

pub type Result<T> = anyhow::Result<T>;
pub type Error = anyhow::Error;

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate derive_builder;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked. Shared
/// maps in this crate hold plain data that stays consistent across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub use client::{ApiClient, ClientConfig, RequestOptions};
pub use error::ApiError;

use rand::Rng;

use crate::error::ApiError;
use crate::http::throttle::Throttle;
use crate::io::Response;
use crate::registry::CancelToken;
use crate::time::Milliseconds;
use crate::{log_debug, log_info};

/// Delay before retry number `attempt` (zero based): `base * 2^attempt`.
/// Saturates instead of overflowing for absurd attempt counts.
pub fn backoff_delay(attempt: u32, base: Milliseconds) -> Milliseconds {
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Milliseconds::new(base.saturating_mul(factor))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero means try once.
    pub retries: u32,
    pub base_delay: Milliseconds,
    /// Upper bound of a random delay added to every wait. Zero disables it.
    pub jitter: Milliseconds,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Milliseconds) -> Self {
        RetryPolicy {
            retries,
            base_delay,
            jitter: Milliseconds::default(),
        }
    }

    pub fn with_jitter(self, jitter: Milliseconds) -> Self {
        RetryPolicy { jitter, ..self }
    }
}

/// What to do after an attempt settles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    /// Final outcome, hand it to the caller.
    Done,
    /// Transient failure, try again if the budget allows.
    Retry,
    /// Failure that another attempt cannot fix.
    Fatal,
}

/// Classifies the outcome of an attempt for the retry loop.
pub trait Classify {
    fn verdict(&self) -> Verdict;
}

impl Classify for std::result::Result<Response, ApiError> {
    fn verdict(&self) -> Verdict {
        match self {
            Ok(response) if response.is_server_error() => Verdict::Retry,
            Ok(_) => Verdict::Done,
            Err(err) if err.is_retryable() => Verdict::Retry,
            Err(_) => Verdict::Fatal,
        }
    }
}

/// ExponentialBackoff runs an operation and retries it with an exponential
/// backoff in between attempts while the outcome classifies as retryable.
pub struct ExponentialBackoff<'a> {
    policy: RetryPolicy,
    throttle: &'a dyn Throttle,
    cancel: Option<&'a CancelToken>,
    num_retries: u32,
}

impl<'a> ExponentialBackoff<'a> {
    pub fn new(policy: RetryPolicy, throttle: &'a dyn Throttle) -> Self {
        ExponentialBackoff {
            policy,
            throttle,
            cancel: None,
            num_retries: 0,
        }
    }

    /// Cut backoff waits short when `token` is cancelled. The operation is
    /// expected to check the token itself and settle with a fatal outcome.
    pub fn with_cancel(self, token: &'a CancelToken) -> Self {
        ExponentialBackoff {
            cancel: Some(token),
            ..self
        }
    }

    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    fn wait_time(&self, attempt: u32) -> Milliseconds {
        let mut wait_time = backoff_delay(attempt, self.policy.base_delay);
        if *self.policy.jitter > 0 {
            let jitter = rand::rng().random_range(0..=*self.policy.jitter);
            wait_time += Milliseconds::new(jitter);
        }
        log_info!("Waiting for {} ms before retry {}", wait_time, attempt + 1);
        wait_time
    }

    /// Run `op` until it produces a non retryable outcome or the retry budget
    /// is spent. `op` receives the zero based attempt number. On exhaustion
    /// the last observed outcome is returned.
    pub fn retry<R, F>(&mut self, mut op: F) -> R
    where
        R: Classify,
        F: FnMut(u32) -> R,
    {
        let mut attempt = 0;
        loop {
            let outcome = op(attempt);
            match outcome.verdict() {
                Verdict::Done => return outcome,
                Verdict::Fatal => {
                    log_debug!("Attempt {} failed with a non retryable outcome", attempt);
                    return outcome;
                }
                Verdict::Retry => {
                    if attempt >= self.policy.retries {
                        log_info!("Retried the request {} times, giving up", self.num_retries);
                        return outcome;
                    }
                    let wait_time = self.wait_time(attempt);
                    match self.cancel {
                        Some(token) => {
                            if self.throttle.throttle_until_cancelled(wait_time, token) {
                                log_debug!("Backoff before retry {} cancelled", attempt + 1);
                            }
                        }
                        None => self.throttle.throttle_for(wait_time),
                    }
                    attempt += 1;
                    self.num_retries = attempt;
                }
            }
        }
    }
}

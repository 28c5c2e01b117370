//! Registry of in-flight logical calls. Every call registers a cancel token
//! before its first attempt and removes it once it settles, so the host can
//! abort everything on shutdown or only the calls matching a URL fragment.
//! The token covers the whole call, the backoff waits between attempts
//! included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::error::ApiError;
use crate::io::Response;
use crate::{lock, log_debug, log_info};

pub type AttemptOutcome = std::result::Result<Response, ApiError>;

#[derive(Default)]
struct TokenState {
    reason: Option<String>,
    attempt: Option<mpsc::Sender<AttemptOutcome>>,
}

/// Cancellation state of one logical call. The attempt on the wire waits on
/// the receiving side of the channel its worker reports to; cancelling sends
/// an abort into that channel, so whichever message arrives first settles
/// the attempt. Waits between attempts block on the token itself.
#[derive(Default)]
pub struct CancelToken {
    state: Mutex<TokenState>,
    cancelled: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// First reason wins. Signals the attempt in progress, if any, and wakes
    /// a pending backoff wait.
    pub fn cancel(&self, reason: &str) {
        let mut state = lock(&self.state);
        if state.reason.is_none() {
            state.reason = Some(reason.to_string());
        }
        if let Some(attempt) = state.attempt.as_ref() {
            // The receiver is gone when the attempt already settled.
            let _ = attempt.send(Err(ApiError::Aborted(reason.to_string())));
        }
        self.cancelled.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).reason.is_some()
    }

    pub fn reason(&self) -> Option<String> {
        lock(&self.state).reason.clone()
    }

    /// Route cancellation into the channel of the attempt about to start.
    /// An already cancelled token aborts it straight away.
    pub(crate) fn arm(&self, attempt: mpsc::Sender<AttemptOutcome>) {
        let mut state = lock(&self.state);
        if let Some(reason) = state.reason.as_ref() {
            let _ = attempt.send(Err(ApiError::Aborted(reason.clone())));
        }
        state.attempt = Some(attempt);
    }

    pub(crate) fn disarm(&self) {
        lock(&self.state).attempt = None;
    }

    /// Block for `timeout` or until cancelled. Returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.state);
        let (state, _) = self
            .cancelled
            .wait_timeout_while(state, timeout, |state| state.reason.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.reason.is_some()
    }
}

#[derive(Default)]
pub struct ActiveRequests {
    tokens: Mutex<HashMap<String, Arc<CancelToken>>>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for a new call against `url`. The URL is kept verbatim so
    /// pattern cancellation can match on path fragments.
    pub fn next_id(&self, url: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{url}:{sequence}")
    }

    /// Token for the call `id`. Once the registry is closed the token comes
    /// back already cancelled and is not tracked.
    pub fn register(&self, id: &str) -> Arc<CancelToken> {
        let token = Arc::new(CancelToken::new());
        let mut tokens = lock(&self.tokens);
        if self.closed.load(Ordering::SeqCst) {
            token.cancel("client has been disposed");
        } else {
            tokens.insert(id.to_string(), token.clone());
        }
        token
    }

    pub fn remove(&self, id: &str) -> bool {
        lock(&self.tokens).remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.tokens).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.tokens).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Abort every registered call and empty the registry. Returns the
    /// number of calls signalled.
    pub fn cancel_all(&self) -> usize {
        self.cancel_all_with("all requests cancelled")
    }

    /// Cancel everything and refuse new calls from now on.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all_with("client has been disposed")
    }

    fn cancel_all_with(&self, reason: &str) -> usize {
        let tokens: Vec<(String, Arc<CancelToken>)> = lock(&self.tokens).drain().collect();
        for (id, token) in tokens.iter() {
            log_debug!("Cancelling request {}", id);
            token.cancel(reason);
        }
        if !tokens.is_empty() {
            log_info!("Cancelled {} in-flight requests", tokens.len());
        }
        tokens.len()
    }

    /// Abort and remove only the calls whose id contains `pattern`.
    pub fn cancel_by_pattern(&self, pattern: &str) -> usize {
        let tokens: Vec<(String, Arc<CancelToken>)> = {
            let mut registered = lock(&self.tokens);
            let ids: Vec<String> = registered
                .keys()
                .filter(|id| id.contains(pattern))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| registered.remove(&id).map(|token| (id, token)))
                .collect()
        };
        for (id, token) in tokens.iter() {
            log_debug!("Cancelling request {} matching {}", id, pattern);
            token.cancel(&format!("requests matching {pattern} cancelled"));
        }
        tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn register(registry: &ActiveRequests, url: &str) -> (String, Arc<CancelToken>) {
        let id = registry.next_id(url);
        let token = registry.register(&id);
        (id, token)
    }

    #[test]
    fn test_ids_are_unique_per_call() {
        let registry = ActiveRequests::new();
        let first = registry.next_id("http://localhost/api/v2/devices");
        let second = registry.next_id("http://localhost/api/v2/devices");
        assert_ne!(first, second);
        assert!(first.starts_with("http://localhost/api/v2/devices:"));
    }

    #[test]
    fn test_cancel_all_signals_and_empties_registry() {
        let registry = ActiveRequests::new();
        let (_, devices) = register(&registry, "http://localhost/api/v2/devices");
        let (_, sites) = register(&registry, "http://localhost/api/v2/sites");
        assert_eq!(2, registry.cancel_all());
        assert!(registry.is_empty());
        assert!(devices.is_cancelled());
        assert_eq!(Some("all requests cancelled".to_string()), sites.reason());
    }

    #[test]
    fn test_cancel_by_pattern_leaves_unrelated_requests() {
        let registry = ActiveRequests::new();
        let (_, devices) = register(&registry, "http://localhost/api/v2/devices");
        let (sites_id, sites) = register(&registry, "http://localhost/api/v2/sites");
        assert_eq!(1, registry.cancel_by_pattern("/devices"));
        assert_eq!(vec![sites_id], registry.ids());
        assert!(devices.is_cancelled());
        assert!(!sites.is_cancelled());
    }

    #[test]
    fn test_remove_settled_call() {
        let registry = ActiveRequests::new();
        let (id, _token) = register(&registry, "http://localhost/api/v2/devices");
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert_eq!(0, registry.cancel_all());
    }

    #[test]
    fn test_closed_registry_hands_out_cancelled_tokens() {
        let registry = ActiveRequests::new();
        let (_, pending) = register(&registry, "http://localhost/api/v2/devices");
        assert_eq!(1, registry.close());
        assert!(pending.is_cancelled());
        let (_, late) = register(&registry, "http://localhost/api/v2/sites");
        assert_eq!(Some("client has been disposed".to_string()), late.reason());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_armed_attempt_receives_abort() {
        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        token.arm(tx);
        token.cancel("shutting down");
        assert_eq!(
            Err(ApiError::Aborted("shutting down".to_string())),
            rx.recv().unwrap()
        );
        token.disarm();
        token.cancel("again");
        assert_eq!(Some("shutting down".to_string()), token.reason());
    }

    #[test]
    fn test_arming_cancelled_token_aborts_immediately() {
        let token = CancelToken::new();
        token.cancel("too late");
        let (tx, rx) = mpsc::channel();
        token.arm(tx);
        assert!(rx.try_recv().unwrap().unwrap_err().is_aborted());
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = Arc::new(CancelToken::new());
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                token.cancel("stop");
            })
        };
        let started = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        canceller.join().unwrap();
    }
}

//! Request cache with in-flight deduplication.
//!
//! A lookup either returns a fresh cached value, joins the flight already
//! fetching the same key, or becomes the owner of a new flight. Only the
//! owner runs the fetch. Successful values are cached for the caller given
//! time to live; failures are handed to every waiter and never cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::ApiError;
use crate::time::{Clock, Milliseconds};
use crate::{lock, log_debug, Result};

pub mod flight;
pub mod key;

use flight::Flight;
pub use key::cache_key;

#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: Milliseconds,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now: Milliseconds) -> bool {
        now < self.expires_at
    }
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    pending: HashMap<String, Arc<Flight<T>>>,
}

enum Lookup<T> {
    Hit(T),
    Join(Arc<Flight<T>>),
    Own(Arc<Flight<T>>),
}

pub struct RequestCache<T> {
    state: Mutex<CacheState<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> RequestCache<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        RequestCache {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                pending: HashMap::new(),
            }),
            clock,
        }
    }

    /// Return the cached value for `key`, join the in-flight request for it,
    /// or run `thunk` and cache its value for `ttl`. A zero `ttl` shares the
    /// value with concurrent callers only.
    pub fn request<F>(&self, key: &str, thunk: F, ttl: Milliseconds) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.lookup(key) {
            Lookup::Hit(value) => {
                log_debug!("Cache hit for {}", key);
                Ok(value)
            }
            Lookup::Join(flight) => {
                log_debug!("Joining in-flight request for {}", key);
                Ok(flight.wait()?)
            }
            Lookup::Own(flight) => {
                let mut owner = FlightOwner {
                    cache: self,
                    key,
                    flight,
                    settled: false,
                };
                let outcome = thunk();
                let shared = match &outcome {
                    Ok(value) => Ok(value.clone()),
                    Err(err) => Err(ApiError::from_anyhow_ref(err)),
                };
                // Waiters get the typed error, the owner keeps its context.
                owner.settle(shared, ttl);
                outcome
            }
        }
    }

    // Freshness check, eviction of a stale entry and flight registration
    // happen under one lock so a sweep or a settling owner cannot slip in
    // between them.
    fn lookup(&self, key: &str) -> Lookup<T> {
        let now = self.clock.now();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(entry) = state.entries.get(key) {
            if entry.is_fresh(now) {
                return Lookup::Hit(entry.value.clone());
            }
        }
        // absent or stale
        state.entries.remove(key);
        if let Some(flight) = state.pending.get(key) {
            return Lookup::Join(flight.clone());
        }
        let flight = Arc::new(Flight::new());
        state.pending.insert(key.to_string(), flight.clone());
        Lookup::Own(flight)
    }

    fn settle(
        &self,
        key: &str,
        flight: &Arc<Flight<T>>,
        outcome: std::result::Result<T, ApiError>,
        ttl: Milliseconds,
    ) {
        {
            let mut state = lock(&self.state);
            if let Ok(value) = &outcome {
                if *ttl > 0 {
                    let expires_at = self.clock.now() + ttl;
                    state.entries.insert(
                        key.to_string(),
                        CacheEntry {
                            value: value.clone(),
                            expires_at,
                        },
                    );
                }
            }
            if state
                .pending
                .get(key)
                .is_some_and(|pending| Arc::ptr_eq(pending, flight))
            {
                state.pending.remove(key);
            }
        }
        flight.complete(outcome);
    }

    /// Fresh value for `key` without triggering a fetch.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        lock(&self.state)
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    /// Remove every entry when `pattern` is `None`, otherwise the exact key
    /// and every key containing `pattern`. In-flight requests are left alone.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut state = lock(&self.state);
        let before = state.entries.len();
        match pattern {
            None => state.entries.clear(),
            Some(pattern) => state.entries.retain(|key, _| !key.contains(pattern)),
        }
        before - state.entries.len()
    }

    /// Evict every expired entry. Returns the number evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now));
        let evicted = before - state.entries.len();
        if evicted > 0 {
            log_debug!("Evicted {} expired cache entries", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

/// Settles the flight if the owner unwinds before producing an outcome, so
/// waiters are never left blocked.
struct FlightOwner<'a, T: Clone> {
    cache: &'a RequestCache<T>,
    key: &'a str,
    flight: Arc<Flight<T>>,
    settled: bool,
}

impl<T: Clone> FlightOwner<'_, T> {
    fn settle(&mut self, outcome: std::result::Result<T, ApiError>, ttl: Milliseconds) {
        self.settled = true;
        self.cache.settle(self.key, &self.flight, outcome, ttl);
    }
}

impl<T: Clone> Drop for FlightOwner<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.settle(
                self.key,
                &self.flight,
                Err(ApiError::Aborted(format!(
                    "request for {} ended before settling",
                    self.key
                ))),
                Milliseconds::default(),
            );
        }
    }
}

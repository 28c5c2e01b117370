// Per-attempt timeout. Each retry gets a fresh budget.
pub const DEFAULT_TIMEOUT_MILLISECONDS: u64 = 30_000;

// Retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;

// Base exponential backoff delay. Attempt n waits base * 2^n.
pub const DEFAULT_RETRY_DELAY_MILLISECONDS: u64 = 1_000;

// Time to live for cached GET responses.
pub const DEFAULT_CACHE_DURATION_MILLISECONDS: u64 = 5 * 60 * 1000;

// Expired cache entries are also evicted lazily on lookup. The sweep bounds
// memory for keys that are never requested again.
pub const DEFAULT_CACHE_SWEEP_INTERVAL_MILLISECONDS: u64 = 10 * 60 * 1000;

// Performance samples older than this are dropped by the metrics sweep.
pub const DEFAULT_METRICS_RETENTION_MILLISECONDS: u64 = 30 * 60 * 1000;

pub const DEFAULT_METRICS_SWEEP_INTERVAL_MILLISECONDS: u64 = 10 * 60 * 1000;

// Headers that take part in cache key derivation. Anything else (tracing ids,
// timestamps) would defeat deduplication.
pub const DEFAULT_CACHE_KEY_HEADERS: [&str; 3] = ["accept", "accept-language", "authorization"];

// Storage key holding the bearer token.
pub const AUTH_TOKEN_KEY: &str = "authToken";

pub const LOGIN_ROUTE: &str = "/login";

pub const CONTENT_TYPE_JSON: &str = "application/json";

// Profiles. Fast is meant for frequently changing data, slow for reference
// data that rarely changes.
pub const FAST_TIMEOUT_MILLISECONDS: u64 = 10_000;
pub const FAST_RETRIES: u32 = 2;
pub const FAST_CACHE_DURATION_MILLISECONDS: u64 = 2 * 60 * 1000;

pub const SLOW_TIMEOUT_MILLISECONDS: u64 = 60_000;
pub const SLOW_RETRIES: u32 = 5;
pub const SLOW_CACHE_DURATION_MILLISECONDS: u64 = 15 * 60 * 1000;

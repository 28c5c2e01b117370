use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::http::Request;

/// Cache key for `request`: `METHOD:url:digest`. The digest covers the body
/// and only the whitelisted headers, so per-request noise such as tracing ids
/// does not split identical requests. The URL stays in clear text so keys can
/// be cleared by URL fragment.
pub fn cache_key<S: AsRef<str>>(request: &Request, key_headers: &[S]) -> String {
    let mut hasher = Sha256::new();
    if let Some(body) = request.body() {
        hasher.update(body.as_bytes());
    }
    hasher.update([0u8]);
    let names: BTreeSet<String> = key_headers
        .iter()
        .map(|name| name.as_ref().to_lowercase())
        .collect();
    for name in names {
        if let Some(value) = request.headers().get(&name) {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
    }
    let digest = hasher.finalize();
    format!("{}:{}:{digest:x}", request.method(), request.url())
}

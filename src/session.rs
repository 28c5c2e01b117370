//! Auth session: where the bearer token lives and where the host currently
//! is. Storage failures degrade to "no token" and are logged, they never
//! fail a request.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::api_defaults::AUTH_TOKEN_KEY;
use crate::error::AddContext;
use crate::interceptor::{Effect, EffectHandler};
use crate::{lock, log_debug, log_warn, Result};

/// Key/value token storage.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.tokens).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        lock(&self.tokens).insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        lock(&self.tokens).remove(key);
    }
}

/// Token store persisted as a flat JSON object on disk. The file is read on
/// every access so tokens written by another process are picked up.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileTokenStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&self.path)
            .err_context(format!("Could not read token file {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let tokens = serde_json::from_str(&contents)
            .err_context(format!("Malformed token file {}", self.path.display()))?;
        Ok(tokens)
    }

    fn store(&self, tokens: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).err_context(format!(
                "Could not create token directory {}",
                parent.display()
            ))?;
        }
        let contents = serde_json::to_string_pretty(tokens)?;
        fs::write(&self.path, contents)
            .err_context(format!("Could not write token file {}", self.path.display()))?;
        Ok(())
    }

    fn update<F: FnOnce(&mut HashMap<String, String>)>(&self, f: F) {
        let result = self.load().and_then(|mut tokens| {
            f(&mut tokens);
            self.store(&tokens)
        });
        if let Err(err) = result {
            log_warn!("Token storage unavailable: {:#}", err);
        }
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.load() {
            Ok(mut tokens) => tokens.remove(key),
            Err(err) => {
                log_warn!("Token storage unavailable: {:#}", err);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        self.update(|tokens| {
            tokens.insert(key.to_string(), value.to_string());
        });
    }

    fn remove(&self, key: &str) {
        self.update(|tokens| {
            tokens.remove(key);
        });
    }
}

/// The host's notion of a current location.
pub trait Navigator: Send + Sync {
    fn current_route(&self) -> String;
    fn navigate(&self, to: &str);
}

pub struct MemoryNavigator {
    route: Mutex<String>,
}

impl MemoryNavigator {
    pub fn new(route: &str) -> Self {
        MemoryNavigator {
            route: Mutex::new(route.to_string()),
        }
    }
}

impl Default for MemoryNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for MemoryNavigator {
    fn current_route(&self) -> String {
        lock(&self.route).clone()
    }

    fn navigate(&self, to: &str) {
        log_debug!("Navigating to {}", to);
        *lock(&self.route) = to.to_string();
    }
}

/// Token stores in lookup order (for instance persistent first, then
/// per-process) plus the navigator. Applies the effects emitted by response
/// interceptors.
pub struct Session {
    stores: Vec<Arc<dyn TokenStore>>,
    navigator: Arc<dyn Navigator>,
}

impl Session {
    pub fn new(stores: Vec<Arc<dyn TokenStore>>, navigator: Arc<dyn Navigator>) -> Self {
        Session { stores, navigator }
    }

    /// In-memory session with no stored token.
    pub fn in_memory() -> Self {
        Session::new(
            vec![Arc::new(MemoryTokenStore::new())],
            Arc::new(MemoryNavigator::default()),
        )
    }

    pub fn token(&self, key: &str) -> Option<String> {
        self.stores
            .iter()
            .filter_map(|store| store.get(key))
            .find(|token| !token.is_empty())
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.token(AUTH_TOKEN_KEY)
    }

    /// Store the token in the first store.
    pub fn set_token(&self, token: &str) {
        if let Some(store) = self.stores.first() {
            store.set(AUTH_TOKEN_KEY, token);
        }
    }

    pub fn navigator(&self) -> Arc<dyn Navigator> {
        self.navigator.clone()
    }
}

impl EffectHandler for Session {
    fn apply(&self, effect: &Effect) {
        match effect {
            Effect::ClearToken { key } => {
                log_debug!("Clearing stored token {}", key);
                for store in &self.stores {
                    store.remove(key);
                }
            }
            Effect::Redirect { to } => self.navigator.navigate(to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::utils::{init_test_logger, LOG_BUFFER};

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("afetch").join("tokens.json"));
        assert_eq!(None, store.get(AUTH_TOKEN_KEY));
        store.set(AUTH_TOKEN_KEY, "abc123");
        assert_eq!(Some("abc123".to_string()), store.get(AUTH_TOKEN_KEY));
        // A fresh handle sees what was persisted.
        let reopened = FileTokenStore::new(store.path());
        assert_eq!(Some("abc123".to_string()), reopened.get(AUTH_TOKEN_KEY));
        reopened.remove(AUTH_TOKEN_KEY);
        assert_eq!(None, store.get(AUTH_TOKEN_KEY));
    }

    #[test]
    fn test_malformed_token_file_degrades_to_no_token() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "not json").unwrap();
        let store = FileTokenStore::new(&path);
        assert_eq!(None, store.get(AUTH_TOKEN_KEY));
        // Writes against a corrupt file are skipped rather than clobbering it.
        store.set(AUTH_TOKEN_KEY, "abc123");
        assert_eq!("not json", fs::read_to_string(&path).unwrap());
        assert!(LOG_BUFFER.lock().unwrap().contains("Malformed token file"));
    }

    #[test]
    fn test_session_looks_up_stores_in_order() {
        let local = Arc::new(MemoryTokenStore::new());
        let per_process = Arc::new(MemoryTokenStore::new());
        per_process.set(AUTH_TOKEN_KEY, "from-session");
        let session = Session::new(
            vec![local.clone(), per_process.clone()],
            Arc::new(MemoryNavigator::default()),
        );
        assert_eq!(Some("from-session".to_string()), session.bearer_token());
        local.set(AUTH_TOKEN_KEY, "from-local");
        assert_eq!(Some("from-local".to_string()), session.bearer_token());
    }

    #[test]
    fn test_empty_token_counts_as_missing() {
        let session = Session::in_memory();
        session.set_token("");
        assert_eq!(None, session.bearer_token());
    }

    #[test]
    fn test_session_applies_effects() {
        let local = Arc::new(MemoryTokenStore::new());
        let per_process = Arc::new(MemoryTokenStore::new());
        local.set(AUTH_TOKEN_KEY, "a");
        per_process.set(AUTH_TOKEN_KEY, "b");
        let navigator = Arc::new(MemoryNavigator::new("/devices"));
        let session = Session::new(vec![local, per_process], navigator.clone());
        session.apply(&Effect::ClearToken {
            key: AUTH_TOKEN_KEY.to_string(),
        });
        session.apply(&Effect::Redirect {
            to: "/login".to_string(),
        });
        assert_eq!(None, session.bearer_token());
        assert_eq!("/login", navigator.current_route());
    }
}

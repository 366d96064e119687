//! Secrets resolution: Docker secrets file → file path → environment
//! variable, in that order, with a per-key TTL cache (§6).
//!
//! Grounded in the `main.rs` `dotenv::dotenv()` bootstrap, made into a
//! proper layered abstraction to support rotation (`invalidate`) rather
//! than a one-shot `.env` load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const DOCKER_SECRETS_DIR: &str = "/run/secrets";

struct CachedSecret {
    value: Option<String>,
    fetched_at: Instant,
}

/// Resolves configuration values by trying, in order: a Docker secrets
/// file named after the key (lowercased) under `/run/secrets/`, a file
/// path given by `<KEY>_FILE`, then the raw environment variable.
pub struct Secrets {
    ttl: Duration,
    docker_secrets_dir: PathBuf,
    cache: RwLock<HashMap<String, CachedSecret>>,
}

impl Default for Secrets {
    fn default() -> Self {
        Self::new()
    }
}

impl Secrets {
    pub fn new() -> Self {
        dotenv::dotenv().ok();
        Self {
            ttl: DEFAULT_TTL,
            docker_secrets_dir: PathBuf::from(DOCKER_SECRETS_DIR),
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_secrets_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            ttl: DEFAULT_TTL,
            docker_secrets_dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves `key`, consulting the cache first. A resolved absence is
    /// cached too, so a missing optional secret doesn't re-stat the
    /// filesystem on every call.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(cached) = self.cache.read().expect("secrets cache poisoned").get(key) {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.value.clone();
            }
        }
        let resolved = self.resolve(key);
        self.cache.write().expect("secrets cache poisoned").insert(
            key.to_string(),
            CachedSecret {
                value: resolved.clone(),
                fetched_at: Instant::now(),
            },
        );
        resolved
    }

    fn resolve(&self, key: &str) -> Option<String> {
        let docker_path = self.docker_secrets_dir.join(key.to_lowercase());
        if let Some(v) = read_trimmed(&docker_path) {
            return Some(v);
        }
        if let Ok(file_path) = std::env::var(format!("{key}_FILE")) {
            if let Some(v) = read_trimmed(Path::new(&file_path)) {
                return Some(v);
            }
        }
        std::env::var(key).ok()
    }

    /// Drops the cached entry for `key`, forcing the next [`Self::get`]
    /// to re-resolve from disk/env (rotation support, §6).
    pub fn invalidate(&self, key: &str) {
        self.cache.write().expect("secrets cache poisoned").remove(key);
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_secrets_file_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api_key"), "from-docker-secret\n").unwrap();
        std::env::set_var("API_KEY", "from-env");
        let secrets = Secrets::with_secrets_dir(dir.path());
        assert_eq!(secrets.get("API_KEY"), Some("from-docker-secret".to_string()));
        std::env::remove_var("API_KEY");
    }

    #[test]
    fn falls_back_to_env_var_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("AGENCY_TEST_SECRET_ENV_ONLY", "env-value");
        let secrets = Secrets::with_secrets_dir(dir.path());
        assert_eq!(
            secrets.get("AGENCY_TEST_SECRET_ENV_ONLY"),
            Some("env-value".to_string())
        );
        std::env::remove_var("AGENCY_TEST_SECRET_ENV_ONLY");
    }

    #[test]
    fn invalidate_forces_a_fresh_resolve() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("AGENCY_TEST_SECRET_ROTATE", "first");
        let secrets = Secrets::with_secrets_dir(dir.path());
        assert_eq!(secrets.get("AGENCY_TEST_SECRET_ROTATE"), Some("first".to_string()));
        std::env::set_var("AGENCY_TEST_SECRET_ROTATE", "second");
        assert_eq!(secrets.get("AGENCY_TEST_SECRET_ROTATE"), Some("first".to_string()));
        secrets.invalidate("AGENCY_TEST_SECRET_ROTATE");
        assert_eq!(secrets.get("AGENCY_TEST_SECRET_ROTATE"), Some("second".to_string()));
        std::env::remove_var("AGENCY_TEST_SECRET_ROTATE");
    }
}

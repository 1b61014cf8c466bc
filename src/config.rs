use std::path::PathBuf;
use std::time::Duration;

// Defaults, overridable through OMG_* environment variables.
pub const DOCKER_BINARY: &str = "docker";
pub const STATE_FILE_NAME: &str = ".omg.json";
pub const START_ATTEMPTS: u32 = 5;
pub const REQUEST_ATTEMPTS: u32 = 5;
pub const RETRY_BACKOFF_MS: u64 = 250;
pub const PROVISION_TIMEOUT_SECS: u64 = 120;
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
// Address under which the host is reachable from inside a container.
pub const CALLBACK_HOST: &str = "host.docker.internal";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub docker_binary: String,
    pub state_file: PathBuf,
    pub start_attempts: u32,
    pub request_attempts: u32,
    pub retry_backoff: Duration,
    pub provision_timeout: Duration,
    pub request_timeout: Duration,
    pub callback_host: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_binary: DOCKER_BINARY.to_string(),
            state_file: default_state_file(),
            start_attempts: START_ATTEMPTS,
            request_attempts: REQUEST_ATTEMPTS,
            retry_backoff: Duration::from_millis(RETRY_BACKOFF_MS),
            provision_timeout: Duration::from_secs(PROVISION_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            callback_host: CALLBACK_HOST.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults with any `OMG_*` overrides from the process environment applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup("OMG_DOCKER") {
            config.docker_binary = v;
        }
        if let Some(v) = lookup("OMG_STATE_FILE") {
            config.state_file = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "OMG_START_ATTEMPTS") {
            config.start_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "OMG_REQUEST_ATTEMPTS") {
            config.request_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "OMG_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&lookup, "OMG_PROVISION_TIMEOUT_SECS") {
            config.provision_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed(&lookup, "OMG_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = lookup("OMG_CALLBACK_HOST") {
            config.callback_host = v;
        }
        // A zero bound would never attempt anything.
        config.start_attempts = config.start_attempts.max(1);
        config.request_attempts = config.request_attempts.max(1);
        config
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

fn default_state_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(STATE_FILE_NAME)
}

use std::env;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "parley-chat";

/// Tunables for one session. Everything has a sensible default; the
/// environment can override most of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ice_grace_window: Duration,
    pub resume_recheck_delay: Duration,
    pub max_ice_restarts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            ice_grace_window: Duration::from_secs(10),
            resume_recheck_delay: Duration::from_millis(1500),
            max_ice_restarts: 3,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("PARLEY_SIGNALING_URL") {
            let url = url.trim();
            if !url.is_empty() {
                // Prefer IPv4 loopback; localhost can resolve to ::1 first.
                config.signaling_url = if url.contains("://localhost") {
                    url.replacen("://localhost", "://127.0.0.1", 1)
                } else {
                    url.to_string()
                };
            }
        }

        if env_truthy("PARLEY_DISABLE_STUN") {
            config.ice_servers.clear();
        } else if let Ok(list) = env::var("PARLEY_ICE_SERVERS") {
            config.ice_servers = list
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(ms) = env_u64("PARLEY_RECONNECT_BASE_MS") {
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_u64("PARLEY_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = attempts.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = env_u64("PARLEY_ICE_GRACE_MS") {
            config.ice_grace_window = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PARLEY_RESUME_RECHECK_MS") {
            config.resume_recheck_delay = Duration::from_millis(ms);
        }
        if let Some(restarts) = env_u64("PARLEY_MAX_ICE_RESTARTS") {
            config.max_ice_restarts = restarts.min(u32::MAX as u64) as u32;
        }

        config
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

fn env_u64(var: &str) -> Option<u64> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                target: "parley::config",
                var,
                value = %raw,
                error = %err,
                "ignoring malformed value"
            );
            None
        }
    }
}

use std::{env, fs, path::Path, time::Duration};

use crate::{backoff::ReconnectPolicy, errors::Error, Result};

/// Typed configuration for the bot process.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,

    // Session bounds
    pub login_timeout: Duration,
    pub teardown_timeout: Duration,
    pub settle_delay: Duration,

    // Supervisor timers
    pub health_check_interval: Duration,
    pub attempts_cooldown: Duration,
    /// `None` disables the stale-error watchdog.
    pub error_watchdog_interval: Option<Duration>,

    // Backoff
    pub reconnect: ReconnectPolicy,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let mut cfg = Self::with_token(bot_token.trim().to_string());

        if let Some(ms) = env_u64("LOGIN_TIMEOUT_MS") {
            cfg.login_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TEARDOWN_TIMEOUT_MS") {
            cfg.teardown_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SETTLE_DELAY_MS") {
            cfg.settle_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("HEALTH_CHECK_INTERVAL_SECS").filter(|s| *s > 0) {
            cfg.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("ATTEMPTS_COOLDOWN_SECS").filter(|s| *s > 0) {
            cfg.attempts_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("ERROR_WATCHDOG_SECS") {
            cfg.error_watchdog_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        // Backoff knobs
        if let Some(ms) = env_u64("RECONNECT_BASE_MS") {
            cfg.reconnect.base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RECONNECT_MAX_MS") {
            cfg.reconnect.max = Duration::from_millis(ms);
        }
        if let Some(m) = env_f64("RECONNECT_MULTIPLIER").filter(|m| m.is_finite() && *m >= 1.0) {
            cfg.reconnect.multiplier = m;
        }
        if let Some(n) = env_u32("RECONNECT_MAX_EXPONENT") {
            cfg.reconnect.max_exponent = n;
        }

        Ok(cfg)
    }

    /// Defaults for everything except the credential.
    pub fn with_token(bot_token: String) -> Self {
        Self {
            bot_token,
            login_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(5 * 60),
            attempts_cooldown: Duration::from_secs(60 * 60),
            error_watchdog_interval: Some(Duration::from_secs(15 * 60)),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    apply_dotenv(&contents);
}

fn apply_dotenv(contents: &str) {
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

use chrono::Duration;
use serde::Deserialize;

/// Engine configuration.
///
/// Deserializable for config files, `from_env` for twelve-factor overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Low-stock threshold used when a product has no configured minimum.
    pub default_low_stock_threshold: i64,
    /// Hours between re-notifications while a breach persists.
    pub alert_cooldown_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_low_stock_threshold: 10,
            alert_cooldown_hours: 24,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(value) = std::env::var("TALLY_LOW_STOCK_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                cfg.default_low_stock_threshold = parsed;
            } else {
                tracing::warn!(%value, "ignoring unparsable TALLY_LOW_STOCK_THRESHOLD");
            }
        }

        if let Ok(value) = std::env::var("TALLY_ALERT_COOLDOWN_HOURS") {
            if let Ok(parsed) = value.parse() {
                cfg.alert_cooldown_hours = parsed;
            } else {
                tracing::warn!(%value, "ignoring unparsable TALLY_ALERT_COOLDOWN_HOURS");
            }
        }

        cfg
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::hours(self.alert_cooldown_hours)
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Business rules the engine enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Max live reservations per member whose end is still in the future.
    pub max_active_reservations: usize,
    pub penalty_min_points: u32,
    pub penalty_max_points: u32,
    /// Credit score a newly enrolled member starts with.
    pub initial_credit_score: i32,
    /// Number of upcoming sessions kept materialized per weekly template.
    pub horizon: usize,
    /// Bound of the background expansion queue.
    pub expansion_queue: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_active_reservations: 3,
            penalty_min_points: 5,
            penalty_max_points: 30,
            initial_credit_score: 100,
            horizon: 2,
            expansion_queue: 256,
        }
    }
}

/// Process-level configuration, read from `SLOTGUARD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Appends since the last compaction that trigger a WAL rewrite.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// How often the horizon keeper re-enqueues every active template.
    pub horizon_refresh: Duration,
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
            horizon_refresh: Duration::from_secs(3600),
            policy: Policy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset or unparsable keys keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(&lookup);
        let defaults = Config::default();
        let d = &defaults.policy;

        let policy = Policy {
            max_active_reservations: env.parse("MAX_ACTIVE_RESERVATIONS").unwrap_or(d.max_active_reservations),
            penalty_min_points: env.parse("PENALTY_MIN_POINTS").unwrap_or(d.penalty_min_points),
            penalty_max_points: env.parse("PENALTY_MAX_POINTS").unwrap_or(d.penalty_max_points),
            initial_credit_score: env.parse("INITIAL_CREDIT_SCORE").unwrap_or(d.initial_credit_score),
            horizon: env.parse("HORIZON").unwrap_or(d.horizon),
            expansion_queue: env.parse("EXPANSION_QUEUE").unwrap_or(d.expansion_queue),
        };

        Self {
            data_dir: env.get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            compact_threshold: env.parse("COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: env.parse("METRICS_PORT"),
            horizon_refresh: env
                .parse("HORIZON_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.horizon_refresh),
            policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotguard.wal")
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(&format!("SLOTGUARD_{key}"))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        let parsed = raw.trim().parse().ok();
        if parsed.is_none() {
            tracing::warn!("ignoring unparsable SLOTGUARD_{key}={raw:?}");
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.policy.max_active_reservations, 3);
        assert_eq!(config.policy.penalty_min_points, 5);
        assert_eq!(config.policy.penalty_max_points, 30);
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotguard.wal"));
    }

    #[test]
    fn overrides_and_garbage() {
        let vars: HashMap<&str, &str> = [
            ("SLOTGUARD_DATA_DIR", "/var/lib/slotguard"),
            ("SLOTGUARD_METRICS_PORT", "9100"),
            ("SLOTGUARD_MAX_ACTIVE_RESERVATIONS", " 5 "),
            ("SLOTGUARD_HORIZON_REFRESH_SECS", "60"),
            ("SLOTGUARD_COMPACT_THRESHOLD", "lots"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotguard"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.policy.max_active_reservations, 5);
        assert_eq!(config.horizon_refresh, Duration::from_secs(60));
        assert_eq!(config.compact_threshold, 1000);
    }
}

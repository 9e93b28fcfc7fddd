//! Driver pass-through options.

use super::ConfigParams;
use std::collections::BTreeMap;
use std::time::Duration;

/// Options handed to a native driver when a connection is opened.
///
/// `configure` merges the `options.*` section of a configuration over the
/// defaults. Keys the struct does not model are kept in [`extras`](Self::extras)
/// so backend-specific settings (`qos`, `retain`, `replica_set`, ...) still
/// reach the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Maximum connections in the native pool.
    pub max_pool_size: u32,
    /// Bound on the native connect call.
    pub connect_timeout: Duration,
    /// Idle timeout for pooled connections.
    pub idle_timeout: Duration,
    /// Whether TCP keep-alive is requested.
    pub keep_alive: bool,
    /// Whether the target namespace (bucket) is created on open.
    pub auto_create: bool,
    /// Whether a primary index is created on open.
    pub auto_index: bool,
    /// Propagation delay after the namespace is created, before first use.
    pub auto_create_delay: Duration,
    /// Whether the native driver should reconnect on its own.
    pub retry_connect: bool,
    /// Remaining options passed through verbatim.
    pub extras: BTreeMap<String, String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 3,
            connect_timeout: Duration::from_millis(5000),
            idle_timeout: Duration::from_millis(10_000),
            keep_alive: true,
            auto_create: false,
            auto_index: false,
            auto_create_delay: Duration::from_millis(2000),
            retry_connect: true,
            extras: BTreeMap::new(),
        }
    }
}

impl ConnectionOptions {
    /// Keys modelled by typed fields.
    const KNOWN_KEYS: &'static [&'static str] = &[
        "max_pool_size",
        "connect_timeout",
        "idle_timeout",
        "keep_alive",
        "auto_create",
        "auto_index",
        "auto_create_delay",
        "retry_connect",
    ];

    /// Returns a copy with the `options.*` section of `config` merged over `self`.
    #[must_use]
    pub fn configure(&self, config: &ConfigParams) -> Self {
        let options = config.get_section("options");
        let mut merged = self.clone();

        if let Some(v) = options.get_as_u64("max_pool_size") {
            merged.max_pool_size = u32::try_from(v).unwrap_or(u32::MAX).max(1);
        }
        if let Some(v) = options.get_as_u64("connect_timeout") {
            merged.connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.get_as_u64("idle_timeout") {
            merged.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.get_as_bool("keep_alive") {
            merged.keep_alive = v;
        }
        if let Some(v) = options.get_as_bool("auto_create") {
            merged.auto_create = v;
        }
        if let Some(v) = options.get_as_bool("auto_index") {
            merged.auto_index = v;
        }
        if let Some(v) = options.get_as_u64("auto_create_delay") {
            merged.auto_create_delay = Duration::from_millis(v);
        }
        if let Some(v) = options.get_as_bool("retry_connect") {
            merged.retry_connect = v;
        }

        for (key, value) in options.iter() {
            if !Self::KNOWN_KEYS.contains(&key) {
                merged.extras.insert(key.to_string(), value.to_string());
            }
        }

        merged
    }

    /// Returns a pass-through option.
    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    /// Sets the auto-create propagation delay.
    #[must_use]
    pub const fn with_auto_create_delay(mut self, delay: Duration) -> Self {
        self.auto_create_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.max_pool_size, 3);
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.auto_create_delay, Duration::from_secs(2));
        assert!(!options.auto_create);
    }

    #[test]
    fn test_configure_merges_over_defaults() {
        let config = ConfigParams::from_tuples(&[
            ("options.max_pool_size", "10"),
            ("options.connect_timeout", "250"),
            ("options.auto_create", "true"),
            ("options.auto_create_delay", "0"),
            ("options.qos", "1"),
            ("connection.host", "ignored"),
        ]);

        let options = ConnectionOptions::default().configure(&config);
        assert_eq!(options.max_pool_size, 10);
        assert_eq!(options.connect_timeout, Duration::from_millis(250));
        assert!(options.auto_create);
        assert_eq!(options.auto_create_delay, Duration::ZERO);
        assert_eq!(options.extra("qos"), Some("1"));
        assert_eq!(options.extra("host"), None);
        assert_eq!(options.idle_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_configure_is_pure() {
        let base = ConnectionOptions::default();
        let _ = base.configure(&ConfigParams::from_tuples(&[("options.keep_alive", "false")]));
        assert!(base.keep_alive);
    }
}

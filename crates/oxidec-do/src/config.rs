//! Connection configuration.
//!
//! ```
//! use oxidec_do::ConnectionConfig;
//! use std::time::Duration;
//!
//! let config = ConnectionConfig {
//!     reply_timeout: Duration::from_secs(5),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! Every field can also be overridden from the environment with
//! [`ConnectionConfig::from_env`]:
//!
//! | variable                         | field               |
//! |----------------------------------|---------------------|
//! | `OXIDEC_DO_REPLY_TIMEOUT_MS`     | `reply_timeout`     |
//! | `OXIDEC_DO_SEND_TIMEOUT_MS`      | `send_timeout`      |
//! | `OXIDEC_DO_BODY_TIMEOUT_MS`      | `body_read_timeout` |
//! | `OXIDEC_DO_MAX_MESSAGE_SIZE`     | `max_message_size`  |
//! | `OXIDEC_DO_TCP_NODELAY`          | `tcp_nodelay`       |

use crate::port::message::DEFAULT_MAX_MESSAGE_SIZE;
use std::time::Duration;

/// Prefix shared by all configuration variables.
pub const ENV_PREFIX: &str = "OXIDEC_DO_";

/// Tunables for a [`Connection`](crate::Connection) and its transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long a two-way call waits for its reply before the connection is
    /// declared broken.
    pub reply_timeout: Duration,

    /// Socket write timeout (None = block).
    pub send_timeout: Option<Duration>,

    /// How long a reader may wait for the body once a prefix has arrived.
    pub body_read_timeout: Option<Duration>,

    /// Largest frame accepted, including the size field.
    pub max_message_size: usize,

    /// Disable Nagle's algorithm on stream sockets.
    pub tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(300),
            send_timeout: Some(Duration::from_secs(30)),
            body_read_timeout: Some(Duration::from_secs(30)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by any `OXIDEC_DO_*` variables that parse.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`, keyed like the
    /// environment variables. Unparsable values are logged and ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let millis = |name: &str| -> Option<u64> {
            let (key, value) = get(name)?;
            match value.trim().parse() {
                Ok(ms) => Some(ms),
                Err(_) => {
                    oxidex_log::warn!("ignoring {key}={value}: not a number of milliseconds");
                    None
                }
            }
        };

        if let Some(ms) = millis("REPLY_TIMEOUT_MS") {
            config.reply_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("SEND_TIMEOUT_MS") {
            config.send_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = millis("BODY_TIMEOUT_MS") {
            config.body_read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(size) = millis("MAX_MESSAGE_SIZE") {
            config.max_message_size = usize::try_from(size).unwrap_or(usize::MAX);
        }
        if let Some((key, value)) = get("TCP_NODELAY") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.tcp_nodelay = true,
                "0" | "false" | "no" | "off" => config.tcp_nodelay = false,
                _ => oxidex_log::warn!("ignoring {key}={value}: not a boolean"),
            }
        }
        config
    }

    /// Sets the reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Sets the socket write timeout.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the body read timeout.
    #[must_use]
    pub fn with_body_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.body_read_timeout = timeout;
        self
    }

    /// Sets the maximum message size.
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets `TCP_NODELAY`.
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Validate configuration, returning error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.reply_timeout.is_zero() {
            return Err("reply_timeout must be > 0");
        }
        if self.max_message_size < crate::port::PREFIX_SIZE {
            return Err("max_message_size cannot hold a message prefix");
        }
        if self.max_message_size > u32::MAX as usize {
            return Err("max_message_size exceeds the 32-bit size field");
        }
        if self.send_timeout.is_some_and(|t| t.is_zero())
            || self.body_read_timeout.is_some_and(|t| t.is_zero())
        {
            return Err("socket timeouts must be > 0 when set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_is_valid() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OXIDEC_DO_REPLY_TIMEOUT_MS", "250"),
            ("OXIDEC_DO_SEND_TIMEOUT_MS", "0"),
            ("OXIDEC_DO_MAX_MESSAGE_SIZE", "4096"),
            ("OXIDEC_DO_TCP_NODELAY", "off"),
        ]
        .into_iter()
        .collect();
        let config = ConnectionConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_owned()));

        assert_eq!(config.reply_timeout, Duration::from_millis(250));
        assert_eq!(config.send_timeout, None);
        assert_eq!(config.max_message_size, 4096);
        assert!(!config.tcp_nodelay);
        assert_eq!(
            config.body_read_timeout,
            ConnectionConfig::default().body_read_timeout
        );
    }

    #[test]
    fn test_garbage_values_ignored() {
        let config = ConnectionConfig::from_lookup(|k| {
            (k == "OXIDEC_DO_REPLY_TIMEOUT_MS").then(|| "soon".to_owned())
        });
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_validate_rejects_tiny_messages() {
        let config = ConnectionConfig::default().with_max_message_size(10);
        assert!(config.validate().is_err());
        assert!(
            ConnectionConfig::default()
                .with_reply_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}

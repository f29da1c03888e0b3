//! Provides [Config] for sessions, clients and servers.
use std::time::Duration;

use crate::message::MAX_PAYLOAD_LEN;

/// Timing and framing options of a session.
///
/// Can be deserialized from JSON. Durations are given in milliseconds and
/// missing fields take their default value.
///
/// ```
/// let config = tagrpc::Config::from_json(r#"{ "read_timeout": 0, "idle_timeout": 30000 }"#).unwrap();
/// assert_eq!(config.read_timeout, None);
/// assert_eq!(config.idle_timeout, std::time::Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum time to wait for the next message. `None` (or `0`) waits forever.
    #[serde(with = "optional_millis")]
    pub read_timeout: Option<Duration>,
    /// Maximum time a single write may take. `None` (or `0`) waits forever.
    #[serde(with = "optional_millis")]
    pub write_timeout: Option<Duration>,
    /// Interval in which initiators send keepalive messages and check for idle peers.
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    /// A session that has not received anything for this long is closed.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// Interval in which a server evicts idle sessions.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    /// If set, outgoing messages are buffered and written at most once per interval.
    #[serde(with = "optional_millis")]
    pub flush_interval: Option<Duration>,
    /// Messages with a larger payload are rejected and close the session.
    pub max_payload_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            keepalive_interval: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(3),
            flush_interval: None,
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod millis {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.map_or(0, |duration| duration.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
    }

    #[test]
    fn zero_disables_timeouts() {
        let config = Config::from_json(r#"{"read_timeout": 0, "write_timeout": null}"#).unwrap();
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.write_timeout, None);
    }

    #[test]
    fn serialize_deserialize() {
        let config = Config {
            flush_interval: Some(Duration::from_millis(5)),
            read_timeout: None,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }
}

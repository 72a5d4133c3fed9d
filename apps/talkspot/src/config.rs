use std::env;
use std::time::Duration;

use crate::telemetry::is_truthy;
use crate::transport::IceServer;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
const DEFAULT_NAMESPACE: &str = "talkspot";
const DEFAULT_SHARE_BASE: &str = "https://talkspot.com";

/// Call-core configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// Prefix for room topics on the signaling bus
    pub channel_namespace: String,
    /// How long a notice stays on the banner
    pub notice_duration: Duration,
    pub event_buffer: usize,
    pub command_buffer: usize,
    pub share_base: String,
}

impl CallConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let disable_stun = lookup("TALKSPOT_DISABLE_STUN")
            .map(|value| is_truthy(&value))
            .unwrap_or(false);
        let ice_servers = if disable_stun {
            Vec::new()
        } else {
            lookup("TALKSPOT_ICE_SERVERS")
                .map(|raw| parse_ice_servers(&raw))
                .unwrap_or_else(|| vec![IceServer::new(DEFAULT_STUN)])
        };
        let notice_ms = lookup("TALKSPOT_NOTICE_MS")
            .and_then(|val| val.parse().ok())
            .unwrap_or(5_000);

        Self {
            ice_servers,
            channel_namespace: lookup("TALKSPOT_CHANNEL_NAMESPACE")
                .filter(|ns| !ns.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            notice_duration: Duration::from_millis(notice_ms),
            event_buffer: lookup("TALKSPOT_EVENT_BUFFER")
                .and_then(|val| val.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(256),
            command_buffer: lookup("TALKSPOT_COMMAND_BUFFER")
                .and_then(|val| val.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(32),
            share_base: lookup("TALKSPOT_SHARE_BASE")
                .unwrap_or_else(|| DEFAULT_SHARE_BASE.to_string()),
        }
    }

    /// Config for tests and local loopback runs: no STUN servers.
    pub fn offline() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }
}

fn parse_ice_servers(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServer::new)
        .collect()
}

impl Default for CallConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers, vec![IceServer::new(DEFAULT_STUN)]);
        assert_eq!(config.channel_namespace, "talkspot");
        assert_eq!(config.notice_duration, Duration::from_secs(5));
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.command_buffer, 32);
        assert_eq!(config.share_base, "https://talkspot.com");
    }

    #[test]
    fn ice_server_list_is_split_and_trimmed() {
        let config = CallConfig::from_lookup(lookup_from(&[(
            "TALKSPOT_ICE_SERVERS",
            "stun:a.example:3478, ,turn:b.example:3478",
        )]));
        assert_eq!(
            config.ice_servers,
            vec![
                IceServer::new("stun:a.example:3478"),
                IceServer::new("turn:b.example:3478")
            ]
        );
    }

    #[test]
    fn disable_stun_wins_over_server_list() {
        let config = CallConfig::from_lookup(lookup_from(&[
            ("TALKSPOT_DISABLE_STUN", "true"),
            ("TALKSPOT_ICE_SERVERS", "stun:a.example:3478"),
        ]));
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn disable_stun_reads_switches_like_other_env_flags() {
        for value in ["1", "yes", "on", "TRUE"] {
            let config = CallConfig::from_lookup(lookup_from(&[("TALKSPOT_DISABLE_STUN", value)]));
            assert!(config.ice_servers.is_empty(), "{value:?} should disable stun");
        }
        for value in ["0", "false", "off", ""] {
            let config = CallConfig::from_lookup(lookup_from(&[("TALKSPOT_DISABLE_STUN", value)]));
            assert_eq!(config.ice_servers.len(), 1, "{value:?} should keep stun");
        }
    }

    #[test]
    fn zero_buffers_fall_back_to_defaults() {
        let config = CallConfig::from_lookup(lookup_from(&[
            ("TALKSPOT_EVENT_BUFFER", "0"),
            ("TALKSPOT_COMMAND_BUFFER", "nope"),
            ("TALKSPOT_NOTICE_MS", "1500"),
        ]));
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.command_buffer, 32);
        assert_eq!(config.notice_duration, Duration::from_millis(1500));
    }

    #[test]
    fn from_env_reads_namespace() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var("TALKSPOT_CHANNEL_NAMESPACE").ok();
        unsafe {
            env::set_var("TALKSPOT_CHANNEL_NAMESPACE", "staging");
        }
        let config = CallConfig::from_env();
        assert_eq!(config.channel_namespace, "staging");
        unsafe {
            match original {
                Some(orig) => env::set_var("TALKSPOT_CHANNEL_NAMESPACE", orig),
                None => env::remove_var("TALKSPOT_CHANNEL_NAMESPACE"),
            }
        }
    }
}

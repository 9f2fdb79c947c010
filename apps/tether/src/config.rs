use std::env;
use std::str::FromStr;
#[cfg(test)]
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use crate::discovery::lan::{DEFAULT_DISCOVERY_PORT, LanConfig};
use crate::discovery::service::DiscoveryConfig;
use crate::discovery::{DEFAULT_INVITATION_TIMEOUT, PeerRole, SERVICE_TYPE};
use crate::session::{CandidatePolicy, SessionConfig};
use crate::transport::webrtc::WebRtcConfig;

/// Tether application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Name shown to the other device
    pub display_name: String,
    /// Discovery scope; peers advertising another type are never seen
    pub service_type: String,
    pub discovery_port: u16,
    pub invitation_timeout: Duration,
    /// Queue remote candidates that beat the remote description
    pub buffer_early_candidates: bool,
    /// STUN/TURN urls; empty on a plain LAN
    pub ice_servers: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let display_name = env::var("TETHER_DISPLAY_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(defaults.display_name);
        let service_type = env::var("TETHER_SERVICE_TYPE")
            .ok()
            .filter(|service| !service.is_empty())
            .unwrap_or(defaults.service_type);
        let discovery_port =
            parse_var("TETHER_DISCOVERY_PORT").unwrap_or(defaults.discovery_port);
        let invitation_timeout = parse_var::<u64>("TETHER_INVITE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.invitation_timeout);
        let buffer_early_candidates = crate::telemetry::env_truthy("TETHER_BUFFER_EARLY_CANDIDATES")
            .unwrap_or(defaults.buffer_early_candidates);
        let ice_servers = env::var("TETHER_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.ice_servers);

        Self {
            display_name,
            service_type,
            discovery_port,
            invitation_timeout,
            buffer_early_candidates,
            ice_servers,
        }
    }

    pub fn candidate_policy(&self) -> CandidatePolicy {
        if self.buffer_early_candidates {
            CandidatePolicy::Buffer
        } else {
            CandidatePolicy::Discard
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            service_type: self.service_type.clone(),
            invitation_timeout: self.invitation_timeout,
            ..DiscoveryConfig::default()
        }
    }

    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            discovery_port: self.discovery_port,
            ..LanConfig::new(self.service_type.clone())
        }
    }

    pub fn session_config(&self, role: PeerRole) -> SessionConfig {
        SessionConfig {
            candidate_policy: self.candidate_policy(),
            ..SessionConfig::new(role)
        }
    }

    pub fn webrtc_config(&self, role: PeerRole) -> WebRtcConfig {
        WebRtcConfig::new(role).with_ice_servers(self.ice_servers.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: "tether".to_string(),
            service_type: SERVICE_TYPE.to_string(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            invitation_timeout: DEFAULT_INVITATION_TIMEOUT,
            buffer_early_candidates: false,
            ice_servers: Vec::new(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target = "config", var = name, value = %raw, "ignoring unparsable value");
            None
        }
    }
}

// Environment variable tests must not run in parallel
#[cfg(test)]
pub(crate) static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "TETHER_DISPLAY_NAME",
        "TETHER_SERVICE_TYPE",
        "TETHER_DISCOVERY_PORT",
        "TETHER_INVITE_TIMEOUT_SECS",
        "TETHER_BUFFER_EARLY_CANDIDATES",
        "TETHER_ICE_SERVERS",
    ];

    fn clear_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_type, "tether-stream");
        assert_eq!(config.discovery_port, 47810);
        assert_eq!(config.invitation_timeout, Duration::from_secs(30));
        assert_eq!(config.candidate_policy(), CandidatePolicy::Discard);
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        unsafe {
            env::set_var("TETHER_DISPLAY_NAME", "Living Room");
            env::set_var("TETHER_SERVICE_TYPE", "tether-lab");
            env::set_var("TETHER_DISCOVERY_PORT", "50000");
            env::set_var("TETHER_INVITE_TIMEOUT_SECS", "5");
            env::set_var("TETHER_BUFFER_EARLY_CANDIDATES", "1");
            env::set_var("TETHER_ICE_SERVERS", "stun:a.example:3478, ,stun:b.example:3478");
        }
        let config = Config::from_env();
        clear_vars();

        assert_eq!(config.display_name, "Living Room");
        assert_eq!(config.service_type, "tether-lab");
        assert_eq!(config.discovery_port, 50000);
        assert_eq!(config.invitation_timeout, Duration::from_secs(5));
        assert_eq!(config.candidate_policy(), CandidatePolicy::Buffer);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
        assert_eq!(config.discovery_config().service_type, "tether-lab");
        assert_eq!(config.lan_config().discovery_port, 50000);
        assert_eq!(
            config.session_config(PeerRole::Viewer).candidate_policy,
            CandidatePolicy::Buffer
        );
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        unsafe {
            env::set_var("TETHER_DISCOVERY_PORT", "not-a-port");
            env::set_var("TETHER_INVITE_TIMEOUT_SECS", "-3");
            env::set_var("TETHER_BUFFER_EARLY_CANDIDATES", "0");
        }
        let config = Config::from_env();
        clear_vars();

        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.invitation_timeout, DEFAULT_INVITATION_TIMEOUT);
        assert!(!config.buffer_early_candidates);
    }
}

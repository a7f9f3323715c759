use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::address::{BuildkitAddress, DEFAULT_ADDRESS};
use crate::error::{ReproError, Result};

/// Environment variable naming the BuildKit endpoint.
pub const BUILDKIT_HOST_ENV: &str = "BUILDKIT_HOST";

/// Environment variable naming the registry namespace of the pushed tag.
pub const NAMESPACE_ENV: &str = "KITRACE_NAMESPACE";

/// Registry the dummy image is pushed to.
pub const DEFAULT_REGISTRY: &str = "localhost:5000";

/// Base image the push phase builds on.
pub const DEFAULT_BASE_IMAGE: &str = "alpine";

/// Delay before the foreground invocation starts.
pub const DEFAULT_STAGGER_SECS: u64 = 10;

const FALLBACK_NAMESPACE: &str = "kitrace";

/// Reproducer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproConfig {
    /// BuildKit endpoint (e.g. "unix:///run/buildkit/buildkitd.sock")
    pub address: String,

    /// Tag pushed by the push phase and pulled by the run phase
    pub image: String,

    /// Image the push phase starts from
    pub base_image: String,

    /// Seconds between the background and the foreground invocation
    pub stagger_secs: u64,

    /// Deadline for the run phase (None = block until cancelled)
    pub run_timeout_secs: Option<u64>,

    /// Suppress progress output
    pub quiet: bool,
}

impl Default for ReproConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            image: default_image(FALLBACK_NAMESPACE),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            stagger_secs: DEFAULT_STAGGER_SECS,
            run_timeout_secs: None,
            quiet: false,
        }
    }
}

impl ReproConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::default();
        if let Some(address) = get(BUILDKIT_HOST_ENV) {
            config.address = address;
        }
        let namespace = get(NAMESPACE_ENV)
            .or_else(|| get("USER"))
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string());
        config.image = default_image(&namespace.to_lowercase());
        config
    }

    /// Parse the configured endpoint.
    pub fn buildkit_address(&self) -> Result<BuildkitAddress> {
        BuildkitAddress::parse(&self.address)
    }

    /// Delay before the foreground invocation.
    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    /// Deadline for the run phase, if any.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    /// Check the configuration before any connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(ReproError::Config("image tag must not be empty".to_string()));
        }
        if self.base_image.trim().is_empty() {
            return Err(ReproError::Config("base image must not be empty".to_string()));
        }
        self.buildkit_address()?;
        Ok(())
    }
}

/// The tag both invocations push to and pull from.
pub fn default_image(namespace: &str) -> String {
    format!("{}/{}/dummy:test", DEFAULT_REGISTRY, namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ReproConfig::default();
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.image, "localhost:5000/kitrace/dummy:test");
        assert_eq!(config.base_image, "alpine");
        assert_eq!(config.stagger(), Duration::from_secs(10));
        assert!(config.run_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_uses_buildkit_host() {
        let config = ReproConfig::from_lookup(lookup_from(&[("BUILDKIT_HOST", "tcp://10.0.0.1:1234")]));
        assert_eq!(config.address, "tcp://10.0.0.1:1234");
    }

    #[test]
    fn test_from_lookup_empty_host_falls_back() {
        let config = ReproConfig::from_lookup(lookup_from(&[("BUILDKIT_HOST", "")]));
        assert_eq!(config.address, DEFAULT_ADDRESS);
    }

    #[test]
    fn test_from_lookup_namespace_precedence() {
        let config = ReproConfig::from_lookup(lookup_from(&[
            ("KITRACE_NAMESPACE", "ci"),
            ("USER", "alice"),
        ]));
        assert_eq!(config.image, "localhost:5000/ci/dummy:test");

        let config = ReproConfig::from_lookup(lookup_from(&[("USER", "Bob")]));
        assert_eq!(config.image, "localhost:5000/bob/dummy:test");

        let config = ReproConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.image, "localhost:5000/kitrace/dummy:test");
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let config = ReproConfig {
            image: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config = ReproConfig {
            address: "nope".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ReproError::Config(_))));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ReproConfig {
            run_timeout_secs: Some(30),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ReproConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_timeout_secs, Some(30));
        assert_eq!(back.image, config.image);
    }
}

//! Session configuration.

use std::time::Duration;

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::auth::AuthPolicy;
use crate::ssh::channel::{ChannelDefaults, MAX_CHANNEL_DATA};
use crate::ssh::hostkey::HostKeyCheck;
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::transport::RekeyPolicy;
use crate::ssh::version::Version;

/// Settings for one [`Session`](super::Session).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use skiff_proto::ssh::session::SessionConfig;
///
/// let config = SessionConfig::default()
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_keepalive_interval(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Limit for the TCP connect plus the identification exchange.
    pub connect_timeout: Duration,
    /// Limit for each key exchange.
    pub kex_timeout: Duration,
    /// Software version sent in our identification string.
    pub client_software: String,
    /// Algorithm preference lists.
    pub algorithms: AlgorithmPreferences,
    /// Automatic rekey thresholds.
    pub rekey: RekeyPolicy,
    /// Which server host keys are trusted.
    pub host_key_check: HostKeyCheck,
    /// Order in which credentials are tried.
    pub auth_policy: AuthPolicy,
    /// Window and packet size for new channels.
    pub channel_defaults: ChannelDefaults,
    /// Interval of SSH_MSG_IGNORE heartbeats after authentication.
    ///
    /// Defaults to None (disabled).
    pub keepalive_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            kex_timeout: Duration::from_secs(30),
            client_software: Version::default_client().software().to_string(),
            algorithms: AlgorithmPreferences::default(),
            rekey: RekeyPolicy::default(),
            host_key_check: HostKeyCheck::default(),
            auth_policy: AuthPolicy::default(),
            channel_defaults: ChannelDefaults::default(),
            keepalive_interval: None,
        }
    }
}

impl SessionConfig {
    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the key exchange timeout.
    pub fn with_kex_timeout(mut self, timeout: Duration) -> Self {
        self.kex_timeout = timeout;
        self
    }

    /// Sets the software version string.
    pub fn with_client_software(mut self, software: impl Into<String>) -> Self {
        self.client_software = software.into();
        self
    }

    /// Sets the algorithm preferences.
    pub fn with_algorithms(mut self, algorithms: AlgorithmPreferences) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Sets the rekey thresholds.
    pub fn with_rekey(mut self, rekey: RekeyPolicy) -> Self {
        self.rekey = rekey;
        self
    }

    /// Sets the host key policy.
    pub fn with_host_key_check(mut self, check: HostKeyCheck) -> Self {
        self.host_key_check = check;
        self
    }

    /// Sets the credential ordering policy.
    pub fn with_auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.auth_policy = policy;
        self
    }

    /// Sets the window and packet size for new channels.
    pub fn with_channel_defaults(mut self, defaults: ChannelDefaults) -> Self {
        self.channel_defaults = defaults;
        self
    }

    /// Enables keep-alive messages.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Checks the configuration for values no session could work with.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] naming the first bad setting.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(SkiffError::Config("connect_timeout must be non-zero".to_string()));
        }
        if self.kex_timeout.is_zero() {
            return Err(SkiffError::Config("kex_timeout must be non-zero".to_string()));
        }
        if self.client_software.is_empty()
            || self
                .client_software
                .chars()
                .any(|c| c == ' ' || c == '-' || !c.is_ascii_graphic())
        {
            return Err(SkiffError::Config(format!(
                "Invalid client software version {:?}",
                self.client_software
            )));
        }
        self.algorithms.validate()?;
        if self.rekey.max_bytes == 0 || self.rekey.max_interval.is_zero() {
            return Err(SkiffError::Config("Rekey thresholds must be non-zero".to_string()));
        }
        if self.channel_defaults.window_size == 0 || self.channel_defaults.max_packet_size == 0 {
            return Err(SkiffError::Config(
                "Channel window and packet size must be non-zero".to_string(),
            ));
        }
        if self.channel_defaults.max_packet_size > MAX_CHANNEL_DATA {
            return Err(SkiffError::Config(format!(
                "Channel max_packet_size {} exceeds the largest receivable chunk of {}",
                self.channel_defaults.max_packet_size, MAX_CHANNEL_DATA
            )));
        }
        if self.keepalive_interval.map_or(false, |i| i.is_zero()) {
            return Err(SkiffError::Config("keepalive_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

//! Subscriber configuration
//!
//! Configuration is plain data: construct it in code or load it from YAML.
//!
//! ```rust
//! use feedline::SubscriberConfig;
//!
//! let config = SubscriberConfig::from_yaml_str(r#"
//! connection_string: "publisher.local:6165"
//! auto_connect: true
//! data_loss_interval_secs: 10.0
//! subscription:
//!   filter_expression: "FILTER ActiveMeasurements WHERE SignalType='FREQ'"
//! "#).unwrap();
//! assert_eq!(config.data_loss_interval().as_secs(), 10);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::request::SubscriptionDescriptor;
use crate::types::{CompressionModes, OperationalEncoding, OperationalModes};
use crate::{Result, SubscriberError};

/// How the command channel is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No authentication.
    #[default]
    None,
    /// Shared-secret authentication with the `Authenticate` command.
    Gateway,
    /// Channel is TLS-wrapped by the caller; the session starts authenticated.
    Tls,
}

/// Operational modes in configuration form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationalModesConfig {
    /// One of `unicode`, `bigendianunicode`, `utf8`, `ansi`.
    pub encoding: String,
    pub gzip: bool,
    pub compress_metadata: bool,
    pub compress_signal_index_cache: bool,
    pub compress_payload: bool,
    pub receive_internal_metadata: bool,
    pub receive_external_metadata: bool,
    pub use_common_serialization_format: bool,
    pub version: u8,
}

impl Default for OperationalModesConfig {
    fn default() -> Self {
        Self {
            encoding: "utf8".to_string(),
            gzip: true,
            compress_metadata: true,
            compress_signal_index_cache: true,
            compress_payload: false,
            receive_internal_metadata: true,
            receive_external_metadata: false,
            use_common_serialization_format: true,
            version: 0,
        }
    }
}

impl OperationalModesConfig {
    /// Packs the options into the wire bit-set.
    pub fn to_modes(&self) -> Result<OperationalModes> {
        let encoding = OperationalEncoding::from_name(&self.encoding)?;
        let compression = if self.gzip {
            CompressionModes(CompressionModes::GZIP)
        } else {
            CompressionModes(CompressionModes::NONE)
        };

        Ok(OperationalModes::new(0)
            .with_version(self.version)
            .with_encoding(encoding)
            .with_compression_modes(compression)
            .with(OperationalModes::COMPRESS_METADATA, self.compress_metadata)
            .with(OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE, self.compress_signal_index_cache)
            .with(OperationalModes::COMPRESS_PAYLOAD_DATA, self.compress_payload)
            .with(OperationalModes::RECEIVE_INTERNAL_METADATA, self.receive_internal_metadata)
            .with(OperationalModes::RECEIVE_EXTERNAL_METADATA, self.receive_external_metadata)
            .with(
                OperationalModes::USE_COMMON_SERIALIZATION_FORMAT,
                self.use_common_serialization_format,
            ))
    }
}

/// Complete subscriber configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Publisher command channel address, `host:port`.
    pub connection_string: String,
    pub security_mode: SecurityMode,
    pub shared_secret: Option<String>,
    pub authentication_id: Option<String>,
    /// Authenticate and/or subscribe as soon as the channel connects.
    pub auto_connect: bool,
    /// Request metadata when auto-connecting and when the server configuration changes.
    pub auto_request_metadata: bool,
    pub metadata_filters: Option<String>,
    pub reconnect_delay_ms: u64,
    /// `None` retries forever.
    pub max_connection_attempts: Option<u32>,
    /// Zero disables the data-loss monitor.
    pub data_loss_interval_secs: f64,
    pub allowed_parsing_exceptions: u32,
    pub parsing_exception_window_secs: f64,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    pub operational_modes: OperationalModesConfig,
    /// Subscription started by auto-connect.
    pub subscription: Option<SubscriptionDescriptor>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            security_mode: SecurityMode::None,
            shared_secret: None,
            authentication_id: None,
            auto_connect: true,
            auto_request_metadata: false,
            metadata_filters: None,
            reconnect_delay_ms: 2000,
            max_connection_attempts: None,
            data_loss_interval_secs: 0.0,
            allowed_parsing_exceptions: 10,
            parsing_exception_window_secs: 5.0,
            event_capacity: 1024,
            operational_modes: OperationalModesConfig::default(),
            subscription: None,
        }
    }
}

impl SubscriberConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self { connection_string: connection_string.into(), ..Self::default() }
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_subscription(mut self, descriptor: SubscriptionDescriptor) -> Self {
        self.subscription = Some(descriptor);
        self
    }

    pub fn with_gateway_security(
        mut self,
        shared_secret: impl Into<String>,
        authentication_id: impl Into<String>,
    ) -> Self {
        self.security_mode = SecurityMode::Gateway;
        self.shared_secret = Some(shared_secret.into());
        self.authentication_id = Some(authentication_id.into());
        self
    }

    pub fn with_data_loss_interval(mut self, interval: Duration) -> Self {
        self.data_loss_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn data_loss_interval(&self) -> Duration {
        secs(self.data_loss_interval_secs)
    }

    pub fn parsing_exception_window(&self) -> Duration {
        secs(self.parsing_exception_window_secs)
    }

    /// Checks everything that would otherwise fail later at start-up.
    pub fn validate(&self) -> Result<()> {
        self.operational_modes.to_modes()?;

        non_negative("data_loss_interval_secs", self.data_loss_interval_secs)?;
        non_negative("parsing_exception_window_secs", self.parsing_exception_window_secs)?;
        if self.event_capacity == 0 {
            return Err(SubscriberError::configuration_error("event_capacity must be > 0"));
        }
        if self.security_mode == SecurityMode::Gateway && self.auto_connect {
            let missing = |value: &Option<String>| value.as_deref().is_none_or(str::is_empty);
            if missing(&self.shared_secret) || missing(&self.authentication_id) {
                return Err(SubscriberError::configuration_error(
                    "gateway security with auto_connect requires shared_secret and \
                     authentication_id",
                ));
            }
        }
        Ok(())
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SubscriberError::configuration_error(format!("{name} must be >= 0")))
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 { Duration::from_secs_f64(value) } else { Duration::ZERO }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = SubscriberConfig::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.data_loss_interval(), Duration::ZERO);
        assert_eq!(config.allowed_parsing_exceptions, 10);
        assert_eq!(config.operational_modes.to_modes().unwrap(), OperationalModes::default());
    }

    #[test]
    fn yaml_overrides_nested_sections() {
        let config = SubscriberConfig::from_yaml_str(
            r#"
connection_string: "10.0.0.5:6165"
security_mode: tls
reconnect_delay_ms: 500
operational_modes:
  encoding: unicode
  gzip: false
"#,
        )
        .unwrap();

        assert_eq!(config.security_mode, SecurityMode::Tls);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(500));
        let modes = config.operational_modes.to_modes().unwrap();
        assert_eq!(modes.encoding(), OperationalEncoding::Unicode);
        assert!(!modes.compression_modes().gzip());
        assert!(modes.compress_metadata());
    }

    #[test]
    fn unknown_encoding_is_fatal() {
        let result = SubscriberConfig::from_yaml_str("operational_modes:\n  encoding: ebcdic\n");
        assert!(matches!(result, Err(SubscriberError::Configuration { .. })));
    }

    #[test]
    fn gateway_auto_connect_requires_credentials() {
        let config = SubscriberConfig {
            security_mode: SecurityMode::Gateway,
            ..SubscriberConfig::default()
        };
        assert!(config.validate().is_err());

        let config =
            SubscriberConfig::new("host:6165").with_gateway_security("secret", "subscriber-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_yaml_is_a_configuration_error() {
        let result = SubscriberConfig::from_yaml_str("reconnect_delay_ms: [1, 2");
        assert!(matches!(result, Err(SubscriberError::Configuration { .. })));
    }
}

//! Monitoring configuration.

use std::sync::Arc;

use super::ports::Logger;

/// Configuration handed to a monitoring adapter at construction.
///
/// The license key is the only switch that decides whether the APM agent is
/// ever loaded. An empty key counts as no key.
#[derive(Clone)]
pub struct MonitoringConfig {
    /// Deployment environment, tagged on the agent as a custom attribute
    pub environment: String,
    /// APM license key
    pub license_key: Option<String>,
    /// Logger for the monitoring layer's own diagnostics
    pub logger: Option<Arc<dyn Logger>>,
}

impl MonitoringConfig {
    /// Create a configuration with no license key and no logger.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            license_key: None,
            logger: None,
        }
    }

    pub fn with_license_key(mut self, license_key: impl Into<String>) -> Self {
        self.license_key = Some(license_key.into());
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// The license key, if one is configured and non-empty.
    pub fn license_key(&self) -> Option<&str> {
        self.license_key.as_deref().filter(|key| !key.is_empty())
    }
}

impl std::fmt::Debug for MonitoringConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringConfig")
            .field("environment", &self.environment)
            .field("license_key", &self.license_key().map(|_| "<redacted>"))
            .field("has_logger", &self.logger.is_some())
            .finish()
    }
}

//! Operator configuration from command-line flags and environment variables.

use crate::controller::ControllerConfig;
use crate::error::{OperatorError, OperatorResult};
use crate::informer::{InformerConfig, ListOptions, NamespaceScope};
use crate::registrar::RegistrarConfig;
use crate::retry::RetryConfig;
use crate::strategy::CanaryConfig;
use crate::telemetry::{LogFormat, TracingConfig};
use clap::Parser;
use std::time::Duration;

/// kdeploy operator: canary rollouts for `Release` resources.
#[derive(Debug, Clone, Parser)]
#[command(name = "kdeploy-operator", version, about)]
pub struct OperatorConfig {
    /// Only watch Releases in this namespace (default: all namespaces)
    #[arg(long, env = "KDEPLOY_NAMESPACE")]
    pub namespace: Option<String>,

    /// Field selector applied to the Release list-watch
    #[arg(long, env = "KDEPLOY_FIELD_SELECTOR")]
    pub field_selector: Option<String>,

    /// Label selector applied to the Release list-watch
    #[arg(long, env = "KDEPLOY_LABEL_SELECTOR")]
    pub label_selector: Option<String>,

    /// Seconds between full re-deliveries of the mirror (0 disables)
    #[arg(long, env = "KDEPLOY_RESYNC_SECONDS", default_value_t = 10)]
    pub resync_seconds: u64,

    /// Milliseconds to wait before retrying a failed list or watch
    #[arg(long, env = "KDEPLOY_RELIST_BACKOFF_MS", default_value_t = 1000)]
    pub relist_backoff_ms: u64,

    /// Seconds to wait for the canary to become ready (0 disables the gate)
    #[arg(long, env = "KDEPLOY_HEALTH_TIMEOUT_SECONDS", default_value_t = 120)]
    pub health_timeout_seconds: u64,

    /// Milliseconds between canary readiness checks
    #[arg(long, env = "KDEPLOY_HEALTH_POLL_MS", default_value_t = 2000)]
    pub health_poll_ms: u64,

    /// Attempts for a status write before giving up
    #[arg(long, env = "KDEPLOY_WRITE_RETRIES", default_value_t = 5)]
    pub write_retries: u32,

    /// Seconds to wait for a newly registered resource type to be served
    #[arg(long, env = "KDEPLOY_ESTABLISHED_TIMEOUT_SECONDS", default_value_t = 30)]
    pub established_timeout_seconds: u64,

    /// Log format: auto, json, pretty or compact
    #[arg(long, env = "KDEPLOY_LOG_FORMAT", default_value = "auto")]
    pub log_format: LogFormat,

    /// Log filter directives (falls back to RUST_LOG, then "info")
    #[arg(long, env = "KDEPLOY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Print the Release CustomResourceDefinition as YAML and exit
    #[arg(long)]
    pub generate_crds: bool,
}

impl OperatorConfig {
    /// Reject combinations that cannot work.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.health_timeout_seconds > 0 && self.health_poll_ms == 0 {
            return Err(OperatorError::InvalidConfig(
                "--health-poll-ms must be positive when the health gate is enabled".to_string(),
            ));
        }
        if self.write_retries == 0 {
            return Err(OperatorError::InvalidConfig(
                "--write-retries must be at least 1".to_string(),
            ));
        }
        if self.established_timeout_seconds == 0 {
            return Err(OperatorError::InvalidConfig(
                "--established-timeout-seconds must be positive".to_string(),
            ));
        }
        for (flag, value) in [
            ("--field-selector", &self.field_selector),
            ("--label-selector", &self.label_selector),
        ] {
            if value.as_deref().is_some_and(|s| s.trim().is_empty()) {
                return Err(OperatorError::InvalidConfig(format!("{flag} is empty")));
            }
        }
        Ok(())
    }

    /// Scope and selectors of the Release list-watch.
    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            namespace: NamespaceScope::from_option(self.namespace.clone()),
            field_selector: self.field_selector.clone(),
            label_selector: self.label_selector.clone(),
        }
    }

    /// Informer tunables.
    pub fn informer_config(&self) -> InformerConfig {
        InformerConfig {
            resync_period: Duration::from_secs(self.resync_seconds),
            relist_backoff: Duration::from_millis(self.relist_backoff_ms),
        }
    }

    /// Canary tunables.
    pub fn canary_config(&self) -> CanaryConfig {
        CanaryConfig {
            health_timeout: Duration::from_secs(self.health_timeout_seconds),
            health_poll_interval: Duration::from_millis(self.health_poll_ms),
        }
    }

    /// Retry policy for status writes.
    pub fn write_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.write_retries)
    }

    /// Registration bounds.
    pub fn registrar_config(&self) -> RegistrarConfig {
        RegistrarConfig {
            established_timeout: Duration::from_secs(self.established_timeout_seconds),
            ..Default::default()
        }
    }

    /// Everything the controller needs.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            list_options: self.list_options(),
            informer: self.informer_config(),
            canary: self.canary_config(),
            write_retry: self.write_retry(),
            registrar: self.registrar_config(),
        }
    }

    /// Log subscriber settings. `RUST_LOG` is consulted when no level is set.
    pub fn tracing_config(&self) -> TracingConfig {
        let log_filter = self
            .log_level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_string());
        TracingConfig {
            log_format: self.log_format,
            log_filter,
            include_location: false,
        }
    }
}

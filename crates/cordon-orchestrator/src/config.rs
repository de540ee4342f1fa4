//! Orchestrator configuration.
//!
//! Settings come from an optional JSON file with environment variable
//! overrides on top, so deployments can ship a baseline file and still
//! adjust per-host values without editing it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;

/// Default AWS region when neither configuration nor CLI supplies one.
pub const DEFAULT_REGION: &str = "us-east-1";

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_wait_timeout_secs() -> u64 {
    300
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

/// Provider-level settings for one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// AWS region to operate in.
    #[serde(default = "default_region")]
    pub region: String,

    /// VPC id of the management network sandboxes peer with.
    #[serde(default)]
    pub management_vpc_id: Option<String>,

    /// Security group in the management network granted ingress into
    /// sandbox groups when management access is required.
    #[serde(default)]
    pub management_security_group_id: Option<String>,

    /// Whether single-subnet sandboxes draw their VPC CIDR from
    /// `static_vpc_cidr` instead of the request.
    #[serde(default)]
    pub static_vpc_mode: bool,

    /// VPC CIDR used in static mode for single-subnet sandboxes.
    #[serde(default)]
    pub static_vpc_cidr: Option<String>,

    /// Whether sandbox security groups admit traffic from the management
    /// security group.
    #[serde(default = "default_true")]
    pub management_access_required: bool,

    /// Bucket holding per-reservation private key material.
    #[serde(default)]
    pub key_pair_bucket: Option<String>,

    /// Upper bound on waits for resource state transitions, in seconds.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Fixed pause between retry attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Pause between polls while waiting on resource state, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: default_region(),
            management_vpc_id: None,
            management_security_group_id: None,
            static_vpc_mode: false,
            static_vpc_cidr: None,
            management_access_required: default_true(),
            key_pair_bucket: None,
            wait_timeout_secs: default_wait_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::validation(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut settings: Settings = serde_json::from_str(&raw)?;
        settings.apply_env();
        Ok(settings)
    }

    /// Default settings with environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    fn apply_env(&mut self) {
        if let Ok(region) = std::env::var("CORDON_REGION") {
            self.region = region;
        }
        if let Ok(vpc) = std::env::var("CORDON_MANAGEMENT_VPC_ID") {
            self.management_vpc_id = Some(vpc);
        }
        if let Ok(group) = std::env::var("CORDON_MANAGEMENT_SECURITY_GROUP_ID") {
            self.management_security_group_id = Some(group);
        }
        if let Ok(mode) = std::env::var("CORDON_STATIC_VPC_MODE") {
            self.static_vpc_mode = mode == "1" || mode.eq_ignore_ascii_case("true");
        }
        if let Ok(cidr) = std::env::var("CORDON_STATIC_VPC_CIDR") {
            self.static_vpc_cidr = Some(cidr);
        }
        if let Ok(bucket) = std::env::var("CORDON_KEY_PAIR_BUCKET") {
            self.key_pair_bucket = Some(bucket);
        }
    }

    /// Management VPC id, or a validation error naming the missing setting.
    pub fn management_vpc(&self) -> Result<&str> {
        self.management_vpc_id.as_deref().ok_or_else(|| {
            OrchestratorError::validation("management_vpc_id is not configured")
        })
    }

    /// Consistency-window retry policy at this deployment's pacing.
    pub fn consistency_retry(&self) -> RetryPolicy {
        RetryPolicy::consistency().with_delay(Duration::from_millis(self.retry_delay_ms))
    }

    /// Idempotent-call retry policy at this deployment's pacing.
    pub fn idempotent_retry(&self) -> RetryPolicy {
        RetryPolicy::idempotent().with_delay(Duration::from_millis(self.retry_delay_ms))
    }

    /// Pause between state polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on state waits.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Settings wired for fast tests: millisecond pacing, management
    /// network configured.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            management_vpc_id: Some("vpc-mgmt".to_string()),
            management_security_group_id: Some("sg-mgmt".to_string()),
            key_pair_bucket: Some("reservation-keys".to_string()),
            wait_timeout_secs: 5,
            retry_delay_ms: 1,
            poll_interval_ms: 1,
            ..Self::default()
        }
    }
}

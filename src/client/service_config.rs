//! Service-config parsing and the gRFC A21 fallback ladder.
//!
//! The accepted shape is deliberately small: a list of load-balancing-config
//! entries (`{"policyName": "...", ...policy-specific fields}`) and an
//! opaque list of method configs, which this crate carries but never
//! interprets (per-method routing/retry policy is out of scope for the
//! load-balancing core).

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::status::Status;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingConfigEntry {
    pub policy_name: String,
    #[serde(flatten)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedServiceConfig {
    #[serde(default)]
    pub load_balancing_configs: Vec<LoadBalancingConfigEntry>,
    #[serde(default)]
    pub method_configs: Vec<Value>,
}

impl ParsedServiceConfig {
    pub fn parse(json: &str) -> Result<Self, Status> {
        serde_json::from_str(json)
            .map_err(|e| Status::with_cause(crate::status::Code::InvalidArgument, "invalid service config", e))
    }
}

/// The hard-coded config used when a resolver reports neither a config nor a
/// config error (ladder step 3): `pick_first`, no method configs.
pub fn default_service_config() -> ParsedServiceConfig {
    ParsedServiceConfig {
        load_balancing_configs: vec![LoadBalancingConfigEntry {
            policy_name: "pick_first".to_string(),
            config: Value::Object(Default::default()),
        }],
        method_configs: vec![],
    }
}

/// The outcome of running one resolver result through the A21 ladder.
#[derive(Debug, Clone)]
pub enum ServiceConfigOutcome {
    /// Service-config handling is disabled; the resolver's config, if any,
    /// was ignored and nothing changes.
    Disabled,
    /// The resolver supplied a config; it becomes the new "previous" one.
    Use(ParsedServiceConfig),
    /// The resolver supplied neither a config nor an error; the hard-coded
    /// default applies and becomes "previous".
    UseDefault(ParsedServiceConfig),
    /// The resolver reported a config error, but a previous config exists;
    /// continue using it.
    Fallback(ParsedServiceConfig),
    /// The resolver reported a config error with no previous config to fall
    /// back to; the whole resolution is a channel failure.
    ChannelFailure(Status),
}

/// Runs the gRFC A21 ladder for one resolver result, updating `previous` in
/// place when a new config is adopted.
pub fn apply_ladder(
    disable_service_config: bool,
    service_config: Option<ParsedServiceConfig>,
    service_config_status: Option<Status>,
    previous: &mut Option<ParsedServiceConfig>,
) -> ServiceConfigOutcome {
    if disable_service_config {
        debug!(target: "grpc::client::channel", "ResolverServiceConfigNotUsed");
        return ServiceConfigOutcome::Disabled;
    }

    match (service_config, service_config_status) {
        (Some(cfg), _) => {
            *previous = Some(cfg.clone());
            ServiceConfigOutcome::Use(cfg)
        }
        (None, None) => {
            let cfg = default_service_config();
            *previous = Some(cfg.clone());
            ServiceConfigOutcome::UseDefault(cfg)
        }
        (None, Some(status)) => match previous.clone() {
            Some(prev) => {
                warn!(target: "grpc::client::channel", %status, "ResolverServiceConfigFallback");
                ServiceConfigOutcome::Fallback(prev)
            }
            None => ServiceConfigOutcome::ChannelFailure(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_short_circuits() {
        let mut previous = None;
        let outcome = apply_ladder(true, Some(default_service_config()), None, &mut previous);
        assert!(matches!(outcome, ServiceConfigOutcome::Disabled));
        assert!(previous.is_none());
    }

    #[test]
    fn config_present_is_used_and_remembered() {
        let mut previous = None;
        let cfg = default_service_config();
        let outcome = apply_ladder(false, Some(cfg), None, &mut previous);
        assert!(matches!(outcome, ServiceConfigOutcome::Use(_)));
        assert!(previous.is_some());
    }

    #[test]
    fn both_null_uses_hardcoded_default() {
        let mut previous = None;
        let outcome = apply_ladder(false, None, None, &mut previous);
        assert!(matches!(outcome, ServiceConfigOutcome::UseDefault(_)));
        assert!(previous.is_some());
    }

    #[test]
    fn error_with_previous_falls_back() {
        let mut previous = Some(default_service_config());
        let outcome = apply_ladder(false, None, Some(Status::unavailable("boom")), &mut previous);
        assert!(matches!(outcome, ServiceConfigOutcome::Fallback(_)));
    }

    #[test]
    fn error_without_previous_is_channel_failure() {
        let mut previous = None;
        let outcome = apply_ladder(false, None, Some(Status::unavailable("boom")), &mut previous);
        assert!(matches!(outcome, ServiceConfigOutcome::ChannelFailure(_)));
    }

    #[test]
    fn parses_policy_name_and_extra_fields() {
        let json = r#"{"loadBalancingConfigs":[{"policyName":"round_robin"}],"methodConfigs":[]}"#;
        let parsed = ParsedServiceConfig::parse(json).unwrap();
        assert_eq!(parsed.load_balancing_configs[0].policy_name, "round_robin");
    }
}

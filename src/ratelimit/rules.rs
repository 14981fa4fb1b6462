//! Route to policy selection.
//!
//! Rules are checked in order and the first rule whose pattern occurs in the
//! request path wins. Paths matching no rule get the default policy.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::policy::{Policy, PolicyName};
use crate::error::{GatekeeperError, Result};

/// A policy as written in configuration: a preset name or inline parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicySpec {
    Named(PolicyName),
    Custom {
        refill_rate: u32,
        capacity: u32,
        cost: u32,
    },
}

impl PolicySpec {
    /// Resolve to a validated policy.
    pub fn resolve(&self) -> Result<Policy> {
        match *self {
            PolicySpec::Named(name) => Ok(name.policy()),
            PolicySpec::Custom {
                refill_rate,
                capacity,
                cost,
            } => Policy::new(refill_rate, capacity, cost),
        }
    }
}

impl Default for PolicySpec {
    fn default() -> Self {
        PolicySpec::Named(PolicyName::General)
    }
}

/// A single route rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Substring of the request path this rule applies to
    pub pattern: String,
    /// Policy to apply
    pub policy: PolicySpec,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>, policy: PolicySpec) -> Self {
        Self {
            pattern: pattern.into(),
            policy,
        }
    }
}

/// The rules shipped by default: login, admin and health endpoints get
/// their own budgets, everything else is general traffic.
pub fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/auth/", PolicySpec::Named(PolicyName::Auth)),
        RouteRule::new("/admin/", PolicySpec::Named(PolicyName::Admin)),
        RouteRule::new("/actuator/health", PolicySpec::Named(PolicyName::Health)),
    ]
}

/// Serialized form of a standalone route rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRulesFile {
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub default_policy: PolicySpec,
}

/// Compiled, validated route rules.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTable {
    rules: Vec<(String, Policy)>,
    fallback: Policy,
}

impl RouteTable {
    /// Validate every rule and build the table.
    pub fn compile(rules: &[RouteRule], default_policy: &PolicySpec) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(|rule| {
                if rule.pattern.is_empty() {
                    return Err(GatekeeperError::Config(
                        "route pattern must not be empty".to_string(),
                    ));
                }
                let policy = rule.policy.resolve().map_err(|e| {
                    GatekeeperError::Config(format!("route '{}': {}", rule.pattern, e))
                })?;
                Ok((rule.pattern.clone(), policy))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules: compiled,
            fallback: default_policy.resolve()?,
        })
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RouteRulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse route rules: {}", e)))?;
        Self::compile(&file.routes, &file.default_policy)
    }

    /// Select the policy for a request path.
    pub fn policy_for(&self, path: &str) -> Policy {
        self.rules
            .iter()
            .find(|(pattern, _)| path.contains(pattern.as_str()))
            .map(|(_, policy)| *policy)
            .unwrap_or(self.fallback)
    }

    /// Number of explicit rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            rules: default_rules()
                .into_iter()
                .filter_map(|rule| match rule.policy {
                    PolicySpec::Named(name) => Some((rule.pattern, name.policy())),
                    PolicySpec::Custom { .. } => None,
                })
                .collect(),
            fallback: Policy::GENERAL,
        }
    }
}

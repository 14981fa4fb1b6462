//! Rate limit policies and the named presets.

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

/// Token bucket parameters applied to a class of endpoints.
///
/// A `Policy` can only be obtained through [`Policy::new`] or the presets,
/// so every value in circulation has positive rate, capacity and cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Policy {
    /// Tokens added per elapsed second
    refill_rate: u32,
    /// Maximum tokens the bucket can hold
    capacity: u32,
    /// Tokens consumed by one request
    cost: u32,
}

impl Policy {
    /// Login and token endpoints. Strict, to slow down credential stuffing.
    pub const AUTH: Policy = Policy::preset(2, 10, 1);
    /// Everything without a more specific rule.
    pub const GENERAL: Policy = Policy::preset(50, 100, 1);
    /// Administrative endpoints.
    pub const ADMIN: Policy = Policy::preset(10, 30, 1);
    /// Health probes, polled frequently by monitoring.
    pub const HEALTH: Policy = Policy::preset(100, 200, 1);

    const fn preset(refill_rate: u32, capacity: u32, cost: u32) -> Self {
        Self {
            refill_rate,
            capacity,
            cost,
        }
    }

    /// Create a validated policy.
    ///
    /// Zero rate, capacity or cost is a configuration error, as is a cost that
    /// exceeds the capacity (such a bucket could never admit anything).
    pub fn new(refill_rate: u32, capacity: u32, cost: u32) -> Result<Self> {
        if refill_rate == 0 {
            return Err(GatekeeperError::Config(
                "refill_rate must be greater than 0".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(GatekeeperError::Config(
                "capacity must be greater than 0".to_string(),
            ));
        }
        if cost == 0 {
            return Err(GatekeeperError::Config(
                "cost must be greater than 0".to_string(),
            ));
        }
        if cost > capacity {
            return Err(GatekeeperError::Config(format!(
                "cost ({}) must not exceed capacity ({})",
                cost, capacity
            )));
        }

        Ok(Self::preset(refill_rate, capacity, cost))
    }

    pub fn refill_rate(&self) -> u32 {
        self.refill_rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

/// Names of the built-in policies, as used in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyName {
    Auth,
    General,
    Admin,
    Health,
}

impl PolicyName {
    /// Get the preset policy for this name.
    pub fn policy(self) -> Policy {
        match self {
            PolicyName::Auth => Policy::AUTH,
            PolicyName::General => Policy::GENERAL,
            PolicyName::Admin => Policy::ADMIN,
            PolicyName::Health => Policy::HEALTH,
        }
    }
}

impl From<PolicyName> for Policy {
    fn from(name: PolicyName) -> Self {
        name.policy()
    }
}

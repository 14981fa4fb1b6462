//! Outcome of a single admission check.

use serde::Serialize;

/// Whether a request was admitted, plus what the caller needs to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    allowed: bool,
    remaining_tokens: u32,
    capacity: u32,
    retry_after_seconds: u64,
}

impl AdmissionResult {
    /// An admitted request.
    pub fn admitted(remaining_tokens: u32, capacity: u32) -> Self {
        Self {
            allowed: true,
            remaining_tokens,
            capacity,
            retry_after_seconds: 0,
        }
    }

    /// A denied request. Nothing remains from the caller's point of view.
    pub fn denied(capacity: u32, retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            remaining_tokens: 0,
            capacity,
            retry_after_seconds,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn remaining_tokens(&self) -> u32 {
        self.remaining_tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn retry_after_seconds(&self) -> u64 {
        self.retry_after_seconds
    }

    /// Fraction of the capacity still available, in `0.0..=1.0`.
    pub fn allowed_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        f64::from(self.remaining_tokens) / f64::from(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admitted_result() {
        let result = AdmissionResult::admitted(75, 100);
        assert!(result.allowed());
        assert_eq!(result.remaining_tokens(), 75);
        assert_eq!(result.capacity(), 100);
        assert_eq!(result.retry_after_seconds(), 0);
        assert!((result.allowed_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_denied_result() {
        let result = AdmissionResult::denied(10, 3);
        assert!(!result.allowed());
        assert_eq!(result.remaining_tokens(), 0);
        assert_eq!(result.capacity(), 10);
        assert_eq!(result.retry_after_seconds(), 3);
        assert_eq!(result.allowed_ratio(), 0.0);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let json = serde_json::to_value(AdmissionResult::denied(10, 1)).unwrap();
        assert_eq!(json["retryAfterSeconds"], 1);
        assert_eq!(json["remainingTokens"], 0);
    }
}

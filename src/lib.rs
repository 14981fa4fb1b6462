//! Gatekeeper - token bucket admission control for API gateways
//!
//! Every request is charged against a per-key budget (authenticated subject
//! or client IP) whose size and refill rate depend on the route. Budgets
//! live in process memory: running several gateway instances multiplies the
//! effective admitted rate by the instance count.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;

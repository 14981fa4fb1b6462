//! Token bucket admission control.

mod bucket;
mod clock;
mod maintenance;
mod policy;
mod registry;
mod result;
mod rules;

pub use bucket::{TokenBucket, MAX_CAS_ATTEMPTS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use maintenance::{MaintenanceHandle, MaintenanceSchedule};
pub use policy::{Policy, PolicyName};
pub use registry::{BucketRegistry, BucketSnapshot, RegistryStats, DEFAULT_SAMPLE_SIZE};
pub use result::AdmissionResult;
pub use rules::{default_rules, PolicySpec, RouteRule, RouteRulesFile, RouteTable};

//! Request-path services and background jobs.

pub mod audit;
pub mod compactor;
pub mod credentials;
pub mod forwarder;
pub mod router;
pub mod scheduler;

pub use audit::AuditLogger;
pub use compactor::{RetentionCompactor, RetentionJob, RunOutcome};
pub use credentials::{CredentialResolver, Principal, hash_api_key};
pub use forwarder::{Forwarder, UpstreamResponse};
pub use router::{Route, ServiceRouter};
pub use scheduler::{CronSchedule, SingleFlight};

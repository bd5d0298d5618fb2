mod api;
mod domain;
mod summary;

pub use api::{
    ApiResponse, EndpointIndex, HealthData, IndexData, PlanInfo, ReadinessData, UsageData,
    UsageInfo,
};
pub use domain::{NewRequestLog, Plan, RateInterval, Service, ServiceLimits, User, UserWithPlan};
pub use summary::{CompactableLog, DailyRollup, LogSummary, summarize};

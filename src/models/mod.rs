pub mod client;
pub mod cron_job;
pub mod flow;
pub mod foreman_rule;
pub mod hunt;
pub mod ids;
pub mod message_handler_request;
pub mod request;

// Re-export core models for easy access
pub use client::{AttributeValue, ClientInfo};
pub use cron_job::{CronAction, CronJob, CronJobRun, TrackedFlow};
pub use flow::{Flow, FlowCommit, FlowResult, FlowStatusReport, PendingTermination, START_STATE};
pub use foreman_rule::{ForemanAction, ForemanRule};
pub use hunt::{Admission, ClientRate, Hunt, HuntAction, HuntCounters, HuntLimits, HuntTemplate};
pub use ids::{ClientId, CronJobId, CronRunId, FlowId, ForemanRuleId, HuntId, RequestId, ResponseId};
pub use message_handler_request::MessageHandlerRequest;
pub use request::{
    FlowRequest, FlowResponse, Payload, RequestWithResponses, Status, StatusCode,
};

//! Run orchestration: state model, stage submission, polling and triggering.

mod metrics;
mod orchestrator;
mod poller;
mod state;
mod submitter;
mod trigger;

pub use metrics::{Metrics, MetricsSnapshot};
pub use orchestrator::Orchestrator;
pub use poller::{CompletionPoller, PollResult};
pub use state::{RunContext, RunOutcome, RunRecord, RunState, StageSubmission};
pub use submitter::{stage_environment, DependencyChain, StageSubmitter};
pub use trigger::{Trigger, TriggerStats};

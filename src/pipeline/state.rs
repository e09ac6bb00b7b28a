//! Run state: the persisted record the orchestrator drives forward.

use super::poller::PollResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Orchestrator states.
///
/// ```text
/// INIT -> SUBMIT_STAGE_1 -> SUBMIT_STAGE_2 -> SUBMIT_STAGE_3 -> POLL
///                                       POLL -> WAIT_AND_RETRY_POLL -> POLL
///                                       POLL -> DONE
/// ```
///
/// Any state may move to FAILED (fatal error) or ABORTED (operator request);
/// POLL and WAIT_AND_RETRY_POLL may move to TIMED_OUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    #[serde(rename = "SUBMIT_STAGE_1")]
    SubmitStage1,
    #[serde(rename = "SUBMIT_STAGE_2")]
    SubmitStage2,
    #[serde(rename = "SUBMIT_STAGE_3")]
    SubmitStage3,
    Poll,
    WaitAndRetryPoll,
    Done,
    Failed,
    Aborted,
    TimedOut,
}

impl RunState {
    /// The submit state for stage `k` (1-based).
    pub fn submit_stage(k: usize) -> Option<Self> {
        match k {
            1 => Some(RunState::SubmitStage1),
            2 => Some(RunState::SubmitStage2),
            3 => Some(RunState::SubmitStage3),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Done | RunState::Failed | RunState::Aborted | RunState::TimedOut
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::SubmitStage1 => "SUBMIT_STAGE_1",
            RunState::SubmitStage2 => "SUBMIT_STAGE_2",
            RunState::SubmitStage3 => "SUBMIT_STAGE_3",
            RunState::Poll => "POLL",
            RunState::WaitAndRetryPoll => "WAIT_AND_RETRY_POLL",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
            RunState::Aborted => "ABORTED",
            RunState::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Values carried through every transition of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Storage namespace and correlation key
    pub run_id: String,
    /// Array size for every stage, fixed once partitioned
    pub total_nodes: usize,
}

/// One accepted array-job launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSubmission {
    /// Ordinal 1..=3
    pub stage_index: usize,
    pub stage_name: String,
    pub job_id: String,
    /// Always the run's `total_nodes`
    pub array_size: usize,
    /// Upstream job ids this stage waited on
    pub depends_on: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

/// How a terminal run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    Succeeded,
    /// Every element is terminal but some failed; needs investigation.
    CompletedWithFailures { failed_elements: usize },
    Failed,
    Aborted,
    TimedOut,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::CompletedWithFailures { failed_elements } => {
                write!(f, "completed with {} failed elements", failed_elements)
            }
            RunOutcome::Failed => write!(f, "failed"),
            RunOutcome::Aborted => write!(f, "aborted"),
            RunOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Persisted run state. Written only by the orchestrator driving the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    /// Array size of every stage; 0 until partitioning succeeds
    pub total_nodes: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: RunState,
    /// Accepted submissions in stage order
    #[serde(default)]
    pub stages: Vec<StageSubmission>,
    #[serde(default)]
    pub poll_attempts: u32,
    #[serde(default)]
    pub consecutive_poll_errors: u32,
    /// Wake-up time while in WAIT_AND_RETRY_POLL
    #[serde(default)]
    pub next_poll_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_poll: Option<PollResult>,
    /// Fatal error that ended the run, if any
    #[serde(default)]
    pub failure: Option<String>,
}

impl RunRecord {
    /// A fresh INIT record for a partitioned run.
    pub fn new(run_id: impl Into<String>, total_nodes: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            total_nodes,
            created_at: now,
            updated_at: now,
            state: RunState::Init,
            stages: Vec::new(),
            poll_attempts: 0,
            consecutive_poll_errors: 0,
            next_poll_at: None,
            last_poll: None,
            failure: None,
        }
    }

    pub fn context(&self) -> RunContext {
        RunContext {
            run_id: self.run_id.clone(),
            total_nodes: self.total_nodes,
        }
    }

    /// Job ids of every accepted stage, in stage order.
    pub fn job_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.job_id.clone()).collect()
    }

    /// Move to `next`, stamping the update time.
    pub fn transition(&mut self, next: RunState) {
        tracing::info!("Run {}: {} -> {}", self.run_id, self.state, next);
        self.state = next;
        self.updated_at = Utc::now();
    }

    /// Move to FAILED, remembering why.
    pub fn fail(&mut self, reason: impl std::fmt::Display) {
        let reason = reason.to_string();
        tracing::error!("Run {} failed in {}: {}", self.run_id, self.state, reason);
        self.failure = Some(reason);
        self.next_poll_at = None;
        self.transition(RunState::Failed);
    }

    /// Terminal outcome, or None while the run is still active.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.state {
            RunState::Done => {
                let failed = self.last_poll.map_or(0, |p| p.failed_elements);
                Some(if failed > 0 {
                    RunOutcome::CompletedWithFailures {
                        failed_elements: failed,
                    }
                } else {
                    RunOutcome::Succeeded
                })
            }
            RunState::Failed => Some(RunOutcome::Failed),
            RunState::Aborted => Some(RunOutcome::Aborted),
            RunState::TimedOut => Some(RunOutcome::TimedOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run {} [{}] nodes: {}, stages submitted: {}, polls: {}",
            self.run_id,
            self.state,
            self.total_nodes,
            self.stages.len(),
            self.poll_attempts
        )?;
        if let Some(poll) = &self.last_poll {
            write!(f, ", failed elements: {}", poll.failed_elements)?;
        }
        if let Some(outcome) = self.outcome() {
            write!(f, ", outcome: {}", outcome)?;
        }
        if let Some(reason) = &self.failure {
            write!(f, ", error: {}", reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&RunState::SubmitStage2).unwrap();
        assert_eq!(json, "\"SUBMIT_STAGE_2\"");
        let json = serde_json::to_string(&RunState::WaitAndRetryPoll).unwrap();
        assert_eq!(json, "\"WAIT_AND_RETRY_POLL\"");
        let state: RunState = serde_json::from_str("\"TIMED_OUT\"").unwrap();
        assert_eq!(state, RunState::TimedOut);
    }

    #[test]
    fn test_submit_stage_roundtrip() {
        for k in 1..=3 {
            let state = RunState::submit_stage(k).unwrap();
            assert_eq!(state.to_string(), format!("SUBMIT_STAGE_{k}"));
        }
        assert!(RunState::submit_stage(4).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(!RunState::WaitAndRetryPoll.is_terminal());
        assert!(!RunState::Init.is_terminal());
    }

    #[test]
    fn test_outcome_distinguishes_element_failures() {
        let mut record = RunRecord::new("run-1", 10);
        assert!(record.outcome().is_none());

        record.last_poll = Some(PollResult {
            finished: true,
            failed_elements: 2,
        });
        record.transition(RunState::Done);
        assert_eq!(
            record.outcome(),
            Some(RunOutcome::CompletedWithFailures { failed_elements: 2 })
        );

        record.last_poll = Some(PollResult {
            finished: true,
            failed_elements: 0,
        });
        assert_eq!(record.outcome(), Some(RunOutcome::Succeeded));
    }

    #[test]
    fn test_fail_records_reason() {
        let mut record = RunRecord::new("run-1", 10);
        record.fail("stage 2 submission rejected");
        assert_eq!(record.state, RunState::Failed);
        assert_eq!(record.failure.as_deref(), Some("stage 2 submission rejected"));
        assert!(record.to_string().contains("outcome: failed"));
    }
}

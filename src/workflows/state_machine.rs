// Step instance state machine
// Pure transition table: which actions are legal from which validation status.
// The store re-checks the status at write time, so a verdict here is only
// valid for the snapshot it was computed from.

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{StepInstance, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    Submit,
    StartReview,
    Approve,
    Reject,
    ForceComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Write the transition
    Proceed,
    /// Target state already reached, report success without writing
    AlreadyDone,
}

impl StepTransition {
    pub fn name(&self) -> &'static str {
        match self {
            StepTransition::Submit => "submit",
            StepTransition::StartReview => "start review",
            StepTransition::Approve => "approve",
            StepTransition::Reject => "reject",
            StepTransition::ForceComplete => "force complete",
        }
    }

    /// Status the step ends in. Force-completion keeps the current status.
    pub fn target(&self) -> Option<StepStatus> {
        match self {
            StepTransition::Submit => Some(StepStatus::Submitted),
            StepTransition::StartReview => Some(StepStatus::UnderReview),
            StepTransition::Approve => Some(StepStatus::Approved),
            StepTransition::Reject => Some(StepStatus::Rejected),
            StepTransition::ForceComplete => None,
        }
    }

    pub fn check(&self, step: &StepInstance) -> WorkflowResult<TransitionResult> {
        use StepStatus::*;

        let verdict = match (self, step.status) {
            // No precondition: submitting re-opens whatever state the step is in.
            (StepTransition::Submit, _) => TransitionResult::Proceed,

            (StepTransition::StartReview, Submitted) => TransitionResult::Proceed,
            (StepTransition::StartReview, UnderReview) => TransitionResult::AlreadyDone,
            (StepTransition::StartReview, _) => return Err(self.refuse(step)),

            (StepTransition::Approve, Approved) => TransitionResult::AlreadyDone,
            (StepTransition::Approve, _) => TransitionResult::Proceed,

            (StepTransition::Reject, Draft) => return Err(self.refuse(step)),
            (StepTransition::Reject, _) => TransitionResult::Proceed,

            (StepTransition::ForceComplete, _) if step.is_completed() => {
                TransitionResult::AlreadyDone
            }
            (StepTransition::ForceComplete, _) => TransitionResult::Proceed,
        };
        Ok(verdict)
    }

    fn refuse(&self, step: &StepInstance) -> WorkflowError {
        WorkflowError::precondition(format!(
            "cannot {} step {} while it is {}",
            self.name(),
            step.id,
            step.status
        ))
    }
}

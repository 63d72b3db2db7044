// Step workflow: transition table and the engine operations driving it

pub mod state_machine;
pub mod steps;

pub use state_machine::{StepTransition, TransitionResult};
